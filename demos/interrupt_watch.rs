use std::cell::Cell;
use std::error::Error;
use std::process::ExitCode;
use std::rc::Rc;

use client_firmata::{DigitalPortFeature, Firmata, InterruptMode, PinMode};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let mut firmata = match std::env::args().nth(1) {
        Some(port) if port == "-h" || port == "--help" => {
            print_usage();
            return Ok(());
        }
        Some(port) => Firmata::open_serial(&port)?,
        None => Firmata::detect_serial()?,
    };
    let digital = firmata.register(DigitalPortFeature::default());

    let presses = Rc::new(Cell::new(0_u32));
    let counter = Rc::clone(&presses);
    digital.set_pin_mode(&mut firmata, 2, PinMode::InputPullup)?;
    digital.attach_interrupt(&mut firmata, 0, InterruptMode::Falling, move || {
        counter.set(counter.get() + 1);
        println!("pin 2 fell ({} total)", counter.get());
    })?;
    digital.set_pin_mode(&mut firmata, 13, PinMode::Output)?;

    let mut led = false;
    let mut seen = 0;
    while presses.get() < 10 {
        firmata.update()?;
        if presses.get() != seen {
            seen = presses.get();
            led = !led;
            digital.digital_write(&mut firmata, 13, led)?;
        }
    }

    Ok(())
}

fn print_usage() {
    println!("Usage:");
    println!("  cargo run --example interrupt_watch -- [PORT]");
}
