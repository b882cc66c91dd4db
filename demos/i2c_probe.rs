use std::error::Error;
use std::io::{Read, Write};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use client_firmata::transport::serial::SerialOptions;
use client_firmata::{Firmata, I2cConfig, I2cError, I2cFeature, I2cOptions, I2cRequest};
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
    let mut args = std::env::args().skip(1);
    let Some(port) = args.next() else {
        print_usage();
        return Ok(());
    };
    let address = match args.next() {
        Some(raw) => u8::from_str_radix(raw.trim_start_matches("0x"), 16)?,
        None => 0x68,
    };
    let register = args
        .next()
        .map(|raw| u16::from_str_radix(raw.trim_start_matches("0x"), 16))
        .transpose()?;

    let options = SerialOptions {
        reset_settle: Duration::from_secs(3),
        ..SerialOptions::default()
    };
    let firmata = Firmata::open_serial_with(&port, &options)?;
    run_probe(firmata, address, register)
}

fn run_probe<T: Read + Write>(
    mut firmata: Firmata<T>,
    address: u8,
    register: Option<u16>,
) -> Result<(), Box<dyn Error>> {
    let i2c = firmata.register(I2cFeature::new(I2cOptions {
        reply_timeout: Duration::from_millis(500),
        ..I2cOptions::default()
    }));

    firmata.request_version()?;
    firmata.query_firmware()?;
    let deadline = Instant::now() + Duration::from_secs(3);
    while firmata.firmware().is_none() && Instant::now() < deadline {
        firmata.update()?;
    }
    match firmata.firmware() {
        Some(fw) => println!("Firmware: {} {}.{}", fw.name, fw.major, fw.minor),
        None => println!("Firmware did not answer; continuing anyway."),
    }

    i2c.config(&mut firmata, &I2cConfig::default())?;

    let request = match register {
        Some(register) => I2cRequest::read_register(address, register, 6),
        None => I2cRequest::read(address, 6),
    };
    let mut buffer = [0_u8; 6];
    match i2c.request(&mut firmata, &request, &mut buffer) {
        Ok(count) => println!("{address:#04x}: {:02X?}", &buffer[..count]),
        Err(I2cError::Timeout { .. }) => println!("{address:#04x}: no reply"),
        Err(err) => return Err(Box::new(err)),
    }

    Ok(())
}

fn print_usage() {
    println!("Usage:");
    println!("  cargo run --example i2c_probe -- <PORT> [ADDRESS_HEX] [REGISTER_HEX]");
}
