// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The USB serial adapter the dispatcher delegates to when a client
//! targets a locally attached device instead of a GPRS session. The real
//! adapter lives outside the core; the loopback implementation here backs
//! the test suite.

use std::time::Duration;

use anyhow::Result;

/// Fixed line speed of the device family.
pub const DEVICE_BAUD: u32 = 115_200;

/// Operations the core consumes from a serial adapter.
pub trait SerialPort: Send + Sync {
    fn open(&self, index: usize, baud: u32) -> Result<()>;
    fn close(&self) -> Result<()>;
    fn write(&self, bytes: &[u8]) -> Result<()>;
    fn read(&self, bufsize: usize, timeout: Duration) -> Result<Vec<u8>>;
    /// Read until CRLF; the line is returned without the terminator.
    fn read_line(&self, timeout: Duration) -> Result<String>;
    fn usb_reset(&self) -> Result<()>;
}

/// A scripted serial double: canned replies are popped per written command.
pub mod loopback {
    use std::{collections::VecDeque, sync::Mutex, time::Duration};

    use anyhow::{Result, bail};

    use super::SerialPort;

    #[derive(Debug, Default)]
    pub struct LoopbackSerial {
        state: Mutex<State>,
    }

    #[derive(Debug, Default)]
    struct State {
        open: bool,
        written: Vec<Vec<u8>>,
        replies: VecDeque<String>,
    }

    impl LoopbackSerial {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue the next reply line returned by `read_line`.
        pub fn push_reply(&self, line: &str) {
            self.state
                .lock()
                .expect("serial poisoned")
                .replies
                .push_back(line.to_string());
        }

        pub fn written(&self) -> Vec<Vec<u8>> {
            self.state.lock().expect("serial poisoned").written.clone()
        }
    }

    impl SerialPort for LoopbackSerial {
        fn open(&self, _index: usize, _baud: u32) -> Result<()> {
            self.state.lock().expect("serial poisoned").open = true;
            Ok(())
        }

        fn close(&self) -> Result<()> {
            self.state.lock().expect("serial poisoned").open = false;
            Ok(())
        }

        fn write(&self, bytes: &[u8]) -> Result<()> {
            let mut state = self.state.lock().expect("serial poisoned");
            if !state.open {
                bail!("serial port not open");
            }
            state.written.push(bytes.to_vec());
            Ok(())
        }

        fn read(&self, bufsize: usize, timeout: Duration) -> Result<Vec<u8>> {
            let line = self.read_line(timeout)?;
            let mut bytes = line.into_bytes();
            bytes.truncate(bufsize);
            Ok(bytes)
        }

        fn read_line(&self, _timeout: Duration) -> Result<String> {
            let mut state = self.state.lock().expect("serial poisoned");
            if !state.open {
                bail!("serial port not open");
            }
            match state.replies.pop_front() {
                Some(line) => Ok(line),
                None => bail!("serial read timeout"),
            }
        }

        fn usb_reset(&self) -> Result<()> {
            Ok(())
        }
    }
}
