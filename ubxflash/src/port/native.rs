//! `serialport`-backed [`Port`] for desktop hosts.

use {
    crate::{
        error::Result,
        port::{
            DataBits, FlowControl, Parity, Port, PortEnumerator, PortInfo, PortOpener,
            SerialConfig, StopBits,
        },
    },
    log::{debug, trace},
    serialport::{ClearBuffer, SerialPort, SerialPortBuilder, SerialPortInfo, SerialPortType},
    std::{
        io::{self, Read, Write},
        time::Duration,
    },
};

/// Serial device opened through `serialport`.
///
/// [`Port::close`] drops the OS handle; I/O after that fails with
/// [`io::ErrorKind::NotConnected`].
pub struct NativePort {
    handle: Option<Box<dyn SerialPort>>,
    name: String,
    timeout: Duration,
}

/// Builder for the device in `config`, framing included.
fn builder(config: &SerialConfig) -> SerialPortBuilder {
    let data_bits = match config.data_bits {
        DataBits::Seven => serialport::DataBits::Seven,
        DataBits::Eight => serialport::DataBits::Eight,
    };
    let parity = match config.parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    };
    let stop_bits = match config.stop_bits {
        StopBits::One => serialport::StopBits::One,
        StopBits::Two => serialport::StopBits::Two,
    };
    let flow_control = match config.flow_control {
        FlowControl::None => serialport::FlowControl::None,
        FlowControl::Hardware => serialport::FlowControl::Hardware,
    };

    serialport::new(&config.port_name, config.baud_rate)
        .timeout(config.timeout)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .flow_control(flow_control)
}

impl NativePort {
    /// Open the device named in `config`.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        debug!(
            "Opening {} at {} baud (timeout {:?})",
            config.port_name, config.baud_rate, config.timeout
        );
        let handle = builder(config).open()?;
        Ok(Self {
            handle: Some(handle),
            name: config
                .port_name
                .clone(),
            timeout: config.timeout,
        })
    }

    fn handle(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.handle
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port closed"))
    }
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Some(handle) = self
            .handle
            .as_mut()
        {
            handle.set_timeout(timeout)?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        if let Some(handle) = self
            .handle
            .as_mut()
        {
            trace!("Clearing buffers of {}", self.name);
            handle.clear(ClearBuffer::All)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        if self
            .handle
            .take()
            .is_some()
        {
            debug!("Closed {}", self.name);
        }
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.handle()?
            .read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.handle()?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.handle()?
            .flush()
    }
}

/// Opens [`NativePort`]s on demand.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePortOpener;

impl PortOpener for NativePortOpener {
    type Port = NativePort;

    fn open(&mut self, config: &SerialConfig) -> Result<NativePort> {
        NativePort::open(config)
    }
}

/// Lists the serial devices the OS reports.
pub struct NativePortEnumerator;

impl PortEnumerator for NativePortEnumerator {
    fn list_ports() -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports()?;
        debug!("Found {} serial ports", ports.len());
        Ok(ports
            .into_iter()
            .map(PortInfo::from)
            .collect())
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let mut port = Self {
            name: info.port_name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        };
        if let SerialPortType::UsbPort(usb) = info.port_type {
            port.vid = Some(usb.vid);
            port.pid = Some(usb.pid);
            port.manufacturer = usb.manufacturer;
            port.product = usb.product;
            port.serial_number = usb.serial_number;
        }
        port
    }
}
