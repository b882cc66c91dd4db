//! In-memory transport for deterministic protocol tests.

use std::collections::VecDeque;
use std::io::{Read, Write};

/// Scripted transport: each queued chunk is handed out by one `read` call, and
/// everything written is captured. An empty queue reads as "nothing available".
#[derive(Debug, Default)]
pub struct MockTransport {
    inbound: VecDeque<Vec<u8>>,
    sent: Vec<u8>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&mut self, bytes: &[u8]) {
        self.inbound.push_back(bytes.to_vec());
    }

    pub fn take_sent(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.sent)
    }

    pub fn pending_chunks(&self) -> usize {
        self.inbound.len()
    }
}

impl Read for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let Some(mut chunk) = self.inbound.pop_front() else {
            return Ok(0);
        };

        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.inbound.push_front(chunk.split_off(n));
        }
        Ok(n)
    }
}

impl Write for MockTransport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.sent.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
