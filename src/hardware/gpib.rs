//! Prologix-style GPIB controller over a serial stream.
//!
//! Protocol overview:
//! - Lines starting with `++` configure the controller itself
//! - Any other line is forwarded to the currently addressed instrument
//! - CR, LF, ESC and `+` inside instrument data must be escaped with ESC
//! - With `++auto 0` the instrument is only asked to talk after `++read eoi`
//!
//! All three instruments of the rig share one controller. The port sits behind
//! an async mutex so a query (address, command, read) is never interleaved
//! with another instrument's traffic.
//!
//! A reply that arrives after its query timed out would otherwise be read as
//! the answer to the next query, possibly from another instrument. Pending
//! input is therefore discarded before every query; after a timeout the bus
//! also waits up to one timeout for the late reply and drops it.
//!
//! # Example
//!
//! ```rust,ignore
//! let bus = Arc::new(PrologixController::open_serial("/dev/ttyUSB0", 115200)?);
//! bus.initialize().await?;
//!
//! let lockin = GpibInstrument::new(bus.clone(), 12, "DSP7265 #1");
//! let x: f64 = lockin.ask_f64("X.").await?;
//! ```

use crate::error::SweepError;
use crate::hardware::adapter::InstrumentLink;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Trait alias for the byte stream to the controller.
///
/// `tokio_serial::SerialStream` in the lab, `tokio::io::DuplexStream` in tests.
pub trait GpibStream: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types meeting the requirements
impl<T: AsyncRead + AsyncWrite + Unpin + Send> GpibStream for T {}

type DynStream = Box<dyn GpibStream>;

const ESC: char = '\u{1b}';

/// Escape instrument data so the controller forwards it verbatim.
pub fn escape(data: &str) -> String {
    let mut escaped = String::with_capacity(data.len());
    for c in data.chars() {
        if matches!(c, '\r' | '\n' | ESC | '+') {
            escaped.push(ESC);
        }
        escaped.push(c);
    }
    escaped
}

struct Port {
    io: BufReader<DynStream>,
    /// Address last sent with `++addr`
    address: Option<u8>,
    /// A query timed out and its reply may still arrive
    stale: bool,
}

/// Shared GPIB controller.
pub struct PrologixController {
    port: Mutex<Port>,
    timeout: Duration,
}

impl PrologixController {
    /// Wrap an already open stream to the controller.
    pub fn new<S: GpibStream + 'static>(stream: S) -> Self {
        Self {
            port: Mutex::new(Port {
                io: BufReader::new(Box::new(stream)),
                address: None,
                stale: false,
            }),
            timeout: Duration::from_secs(1),
        }
    }

    /// Open a USB-serial GPIB controller.
    ///
    /// # Errors
    /// Returns error if the serial port cannot be opened
    #[cfg(feature = "instrument_serial")]
    pub fn open_serial(port_path: &str, baud_rate: u32) -> Result<Self> {
        use tokio_serial::SerialPortBuilderExt;

        let stream = tokio_serial::new(port_path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| format!("Failed to open GPIB controller on {}", port_path))?;
        Ok(Self::new(stream))
    }

    /// Set the reply timeout (default 1 s)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reply timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Put the controller in controller mode with EOI/LF framing and manual reads.
    pub async fn initialize(&self) -> Result<()> {
        let mut port = self.port.lock().await;
        for line in ["++mode 1", "++auto 0", "++eoi 1", "++eos 2"] {
            Self::send_line(&mut port, line).await?;
        }
        port.address = None;
        debug!("GPIB controller initialized");
        Ok(())
    }

    /// Send `command` to the instrument at `address`.
    pub async fn write(&self, address: u8, command: &str) -> Result<()> {
        let mut port = self.port.lock().await;
        Self::select(&mut port, address).await?;
        Self::send_line(&mut port, &escape(command)).await
    }

    /// Send `query` to the instrument at `address` and read one reply line.
    pub async fn query(&self, address: u8, query: &str) -> Result<String> {
        let mut port = self.port.lock().await;
        let window = if port.stale {
            self.timeout
        } else {
            Duration::ZERO
        };
        let discarded = Self::discard_input(&mut port, window).await?;
        if discarded > 0 {
            debug!(address, discarded, "Discarded stale GPIB input");
        }
        port.stale = false;

        Self::select(&mut port, address).await?;
        Self::send_line(&mut port, &escape(query)).await?;
        Self::send_line(&mut port, "++read eoi").await?;

        let mut reply = String::new();
        let read = match tokio::time::timeout(self.timeout, port.io.read_line(&mut reply)).await {
            Ok(read) => read.context("GPIB controller read failed")?,
            Err(_) => {
                port.stale = true;
                return Err(SweepError::timeout(
                    format!("GPIB {} query '{}'", address, query),
                    self.timeout,
                )
                .into());
            }
        };
        if read == 0 {
            return Err(SweepError::Instrument(format!(
                "GPIB controller closed the connection during '{}'",
                query
            ))
            .into());
        }

        let reply = reply.trim().to_string();
        trace!(address, query, reply = %reply, "GPIB query");
        Ok(reply)
    }

    /// Drop buffered and incoming bytes until the line stays quiet for `window`.
    ///
    /// A zero window only takes what is already available.
    async fn discard_input(port: &mut Port, window: Duration) -> Result<usize> {
        let mut discarded = 0;
        loop {
            let available = match tokio::time::timeout(window, port.io.fill_buf()).await {
                Ok(filled) => filled.context("GPIB controller read failed")?.len(),
                Err(_) => break,
            };
            if available == 0 {
                break;
            }
            port.io.consume(available);
            discarded += available;
        }
        Ok(discarded)
    }

    async fn select(port: &mut Port, address: u8) -> Result<()> {
        if port.address != Some(address) {
            Self::send_line(port, &format!("++addr {}", address)).await?;
            port.address = Some(address);
        }
        Ok(())
    }

    async fn send_line(port: &mut Port, line: &str) -> Result<()> {
        let io = port.io.get_mut();
        io.write_all(line.as_bytes())
            .await
            .context("GPIB controller write failed")?;
        io.write_all(b"\n")
            .await
            .context("GPIB controller write failed")?;
        io.flush().await.context("GPIB controller flush failed")?;
        Ok(())
    }
}

/// One addressed instrument on a shared controller.
#[derive(Clone)]
pub struct GpibInstrument {
    bus: Arc<PrologixController>,
    address: u8,
    name: String,
}

impl GpibInstrument {
    /// Handle for the instrument at primary `address`.
    pub fn new(bus: Arc<PrologixController>, address: u8, name: impl Into<String>) -> Self {
        Self {
            bus,
            address,
            name: name.into(),
        }
    }
}

#[async_trait]
impl InstrumentLink for GpibInstrument {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, command: &str) -> Result<()> {
        self.bus
            .write(self.address, command)
            .await
            .with_context(|| format!("{} write '{}'", self.name, command))
    }

    async fn ask(&self, query: &str) -> Result<String> {
        self.bus
            .query(self.address, query)
            .await
            .with_context(|| format!("{} query '{}'", self.name, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    /// Reads the next line written by the controller side.
    async fn next_line(device: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        device.read_line(&mut line).await.unwrap();
        line.trim_end_matches('\n').to_string()
    }

    fn pair() -> (PrologixController, BufReader<DuplexStream>) {
        let (client, device) = tokio::io::duplex(1024);
        (
            PrologixController::new(client).with_timeout(Duration::from_millis(200)),
            BufReader::new(device),
        )
    }

    #[test]
    fn escapes_special_characters() {
        assert_eq!(escape("DAC. 3 5"), "DAC. 3 5");
        assert_eq!(escape("CONF:CURR 1e+1"), "CONF:CURR 1e\u{1b}+1");
        assert_eq!(escape("A\rB"), "A\u{1b}\rB");
    }

    #[tokio::test]
    async fn initialize_sends_controller_setup() {
        let (bus, mut device) = pair();
        bus.initialize().await.unwrap();

        assert_eq!(next_line(&mut device).await, "++mode 1");
        assert_eq!(next_line(&mut device).await, "++auto 0");
        assert_eq!(next_line(&mut device).await, "++eoi 1");
        assert_eq!(next_line(&mut device).await, "++eos 2");
    }

    #[tokio::test]
    async fn address_is_sent_only_on_change() {
        let (bus, mut device) = pair();
        bus.write(12, "DAC. 3 0").await.unwrap();
        bus.write(12, "DAC. 4 0").await.unwrap();
        bus.write(11, "X.").await.unwrap();

        assert_eq!(next_line(&mut device).await, "++addr 12");
        assert_eq!(next_line(&mut device).await, "DAC. 3 0");
        assert_eq!(next_line(&mut device).await, "DAC. 4 0");
        assert_eq!(next_line(&mut device).await, "++addr 11");
        assert_eq!(next_line(&mut device).await, "X.");
    }

    #[tokio::test]
    async fn query_reads_reply_after_read_command() {
        let (bus, mut device) = pair();
        let bus = Arc::new(bus);
        let lockin = GpibInstrument::new(bus.clone(), 12, "lock-in");

        let task = tokio::spawn(async move { lockin.ask_f64("X.").await });

        assert_eq!(next_line(&mut device).await, "++addr 12");
        assert_eq!(next_line(&mut device).await, "X.");
        assert_eq!(next_line(&mut device).await, "++read eoi");
        device.get_mut().write_all(b"1.25E-06\r\n").await.unwrap();

        assert_eq!(task.await.unwrap().unwrap(), 1.25e-6);
    }

    #[tokio::test]
    async fn silent_instrument_times_out() {
        let (bus, _device) = pair();
        let err = bus.query(8, "SOUR:CURR?").await.unwrap_err();
        match err.downcast_ref::<SweepError>() {
            Some(SweepError::Timeout { operation, .. }) => {
                assert!(operation.contains("SOUR:CURR?"));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn late_reply_after_timeout_is_not_taken_by_next_query() {
        let (bus, mut device) = pair();
        let bus = Arc::new(bus);
        assert!(bus.query(12, "X.").await.is_err());
        // The lock-in answers only after the controller gave up
        device.get_mut().write_all(b"1.25E-06\r\n").await.unwrap();

        let next = tokio::spawn({
            let bus = bus.clone();
            async move { bus.query(8, "SOUR:CURR?").await }
        });
        for expected in ["++addr 12", "X.", "++read eoi", "++addr 8", "SOUR:CURR?", "++read eoi"] {
            assert_eq!(next_line(&mut device).await, expected);
        }
        device.get_mut().write_all(b"2.0\n").await.unwrap();

        assert_eq!(next.await.unwrap().unwrap(), "2.0");
    }

    #[tokio::test]
    async fn unsolicited_input_is_discarded_before_query() {
        let (bus, mut device) = pair();
        let bus = Arc::new(bus);
        device.get_mut().write_all(b"garbage\n").await.unwrap();
        tokio::task::yield_now().await;

        let query = tokio::spawn({
            let bus = bus.clone();
            async move { bus.query(11, "Y.").await }
        });
        for expected in ["++addr 11", "Y.", "++read eoi"] {
            assert_eq!(next_line(&mut device).await, expected);
        }
        device.get_mut().write_all(b"-3.0E-07\n").await.unwrap();

        assert_eq!(query.await.unwrap().unwrap(), "-3.0E-07");
    }

    #[tokio::test]
    async fn closed_controller_is_an_instrument_error() {
        let (bus, device) = pair();
        drop(device);
        assert!(bus.query(12, "Y.").await.is_err());
    }
}
