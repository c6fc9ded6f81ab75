use std::io::{Read, Write};
use std::time::Duration;

use hedrot_traits::{ByteChannel, ChannelError, PortDescriptor};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info, warn};

/// `serialport`-backed link to the head tracker, 8N1 without flow control.
///
/// Reads only take what the driver already buffered, so neither `readable`
/// nor `read` waits for the device.
pub struct SerialChannel {
    serial_port: Option<Box<dyn SerialPort>>,
    timeout: Duration,
}

impl SerialChannel {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_millis(10))
    }

    /// `timeout` bounds writes; reads never wait for it.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            serial_port: None,
            timeout,
        }
    }

    pub fn port_name(&self) -> Option<String> {
        self.serial_port.as_ref().and_then(|p| p.name())
    }
}

impl Default for SerialChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteChannel for SerialChannel {
    fn enumerate(&mut self) -> Vec<PortDescriptor> {
        match serialport::available_ports() {
            Ok(ports) => ports
                .into_iter()
                .map(|p| PortDescriptor::new(p.port_name))
                .collect(),
            Err(e) => {
                warn!("Cannot enumerate serial ports: {}", e);
                Vec::new()
            }
        }
    }

    fn open(&mut self, port: &PortDescriptor, baud_rate: u32) -> Result<(), ChannelError> {
        self.close();
        let serial_port = serialport::new(&port.name, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.timeout)
            .open()?;
        // drop whatever a previous session left in the buffers
        serial_port.clear(ClearBuffer::All)?;
        info!("Opened port: {} at {} baud", port.name, baud_rate);
        self.serial_port = Some(serial_port);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(port) = self.serial_port.take() {
            debug!("Closed port: {}", port.name().unwrap_or_default());
        }
    }

    fn is_open(&self) -> bool {
        self.serial_port.is_some()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, ChannelError> {
        let port = self.serial_port.as_mut().ok_or(ChannelError::NotOpen)?;
        port.write_all(bytes)?;
        Ok(bytes.len())
    }

    fn readable(&mut self) -> bool {
        self.serial_port
            .as_ref()
            .is_some_and(|p| p.bytes_to_read().map(|n| n > 0).unwrap_or(false))
    }

    fn read(&mut self) -> Result<Vec<u8>, ChannelError> {
        let port = self.serial_port.as_mut().ok_or(ChannelError::NotOpen)?;
        let pending = port.bytes_to_read()? as usize;
        if pending == 0 {
            return Ok(Vec::new());
        }
        let mut buffer = vec![0u8; pending];
        match port.read(&mut buffer) {
            Ok(n) => {
                buffer.truncate(n);
                Ok(buffer)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}
