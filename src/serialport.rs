use crate::poller::Transport;
use crate::protocol::*;
use crate::Error;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

// Pause after the wake-up frame and the login line before the console answers.
const WAKEUP_SETTLE: Duration = Duration::from_millis(500);

/// Text console of the master module, reached over a serial port.
pub struct ConsoleTransport {
    serial: Box<dyn serialport::SerialPort>,
    last_execution: Instant,
    delay: Duration,
    timeout: Duration,
}

fn open_port(port: &str, baud_rate: u32) -> Result<Box<dyn serialport::SerialPort>, Error> {
    serialport::new(port, baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(MINIMUM_DELAY)
        .open()
        .map_err(|e| Error::Io(e.into()))
}

impl ConsoleTransport {
    /// Opens `port`. With `wakeup` set, the console is first woken at
    /// [`WAKEUP_BAUD_RATE`] and logged into before switching to `baud_rate`.
    pub fn open(port: &str, baud_rate: u32, timeout: Duration, wakeup: bool) -> Result<Self, Error> {
        let mut serial = if wakeup {
            log::info!("Waking console on {port}");
            let mut serial = open_port(port, WAKEUP_BAUD_RATE)?;
            serial.write_all(WAKEUP_FRAME)?;
            serial.flush()?;
            std::thread::sleep(WAKEUP_SETTLE);
            serial
                .set_baud_rate(baud_rate)
                .map_err(|e| Error::Io(e.into()))?;
            serial.write_all(LOGIN)?;
            serial.flush()?;
            std::thread::sleep(WAKEUP_SETTLE);
            serial
        } else {
            open_port(port, baud_rate)?
        };
        serial
            .clear(serialport::ClearBuffer::All)
            .map_err(|e| Error::Io(e.into()))?;
        log::info!("Console on {port} ready at {baud_rate} baud");
        Ok(Self {
            serial,
            last_execution: Instant::now(),
            delay: MINIMUM_DELAY,
            timeout,
        })
    }

    fn serial_await_delay(&self) {
        let last_exec_diff = Instant::now().duration_since(self.last_execution);
        if let Some(time_until_delay_reached) = self.delay.checked_sub(last_exec_diff) {
            std::thread::sleep(time_until_delay_reached);
        }
    }

    fn send_bytes(&mut self, tx_buffer: &[u8]) -> Result<(), Error> {
        // clear all incoming serial to avoid data collision
        loop {
            let pending = self
                .serial
                .bytes_to_read()
                .map_err(|e| Error::Io(e.into()))?;
            if pending == 0 {
                break;
            }
            log::trace!("Got {} pending bytes", pending);
            let mut buf: Vec<u8> = vec![0; 256];
            let received = self.serial.read(buf.as_mut_slice())?;
            log::trace!("Discarded {} pending bytes", received);
        }
        self.serial_await_delay();
        self.serial.write_all(tx_buffer)?;
        self.serial.flush()?;
        Ok(())
    }

    fn receive_reply(&mut self, command: &Command) -> Result<Vec<u8>, Error> {
        let deadline = Instant::now() + self.timeout;
        let mut rx_buffer = Vec::with_capacity(1024);
        let mut chunk = [0u8; 256];
        while !is_complete(&rx_buffer) {
            if Instant::now() >= deadline {
                log::warn!(
                    "'{command}' timed out after {:?} with {} bytes received",
                    self.timeout,
                    rx_buffer.len()
                );
                return Err(Error::TransportTimeout {
                    address: command.address(),
                });
            }
            match self.serial.read(&mut chunk) {
                Ok(n) => rx_buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.last_execution = Instant::now();

        // drop whatever preceded the echo of our own request
        let echo = command.to_string();
        let start = rx_buffer
            .windows(echo.len())
            .position(|w| w == echo.as_bytes())
            .unwrap_or(0);
        log::trace!("receive_reply: {} bytes", rx_buffer.len() - start);
        Ok(rx_buffer.split_off(start))
    }

    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = Duration::max(delay, MINIMUM_DELAY);
    }
}

impl Transport for ConsoleTransport {
    fn exchange(&mut self, command: &Command) -> Result<Vec<u8>, Error> {
        log::debug!("Sending '{command}'");
        self.send_bytes(&command.request())?;
        self.receive_reply(command)
    }
}
