use crate::config::SerialConfig;
use serialport::{DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};
use std::io::{self, Write};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        source: serialport::Error,
    },
    #[error("failed to deassert DTR/RTS on {port}: {source}")]
    ControlLines {
        port: String,
        source: serialport::Error,
    },
    #[error("serial link lost: {0}")]
    LinkLost(io::Error),
    #[error("serial write failed: {0}")]
    Write(io::Error),
    #[error("serial link already closed")]
    Closed,
}

impl TransportError {
    pub fn is_link_lost(&self) -> bool {
        matches!(self, TransportError::LinkLost(_) | TransportError::Closed)
    }
}

pub trait FrameSink {
    fn write_frame(&mut self, frame: &str) -> Result<(), TransportError>;
    fn close(&mut self);
}

pub struct SerialLink {
    port_name: String,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialLink {
    pub fn open(cfg: &SerialConfig) -> Result<Self, TransportError> {
        let mut port = serialport::new(&cfg.port, cfg.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(cfg.timeout())
            .open()
            .map_err(|source| TransportError::Open {
                port: cfg.port.clone(),
                source,
            })?;

        // DTR/RTS pulses on open reset most USB-attached boards.
        let deassert = port
            .write_data_terminal_ready(false)
            .and_then(|_| port.write_request_to_send(false));
        if let Err(source) = deassert {
            return Err(TransportError::ControlLines {
                port: cfg.port.clone(),
                source,
            });
        }

        info!(
            port = %cfg.port,
            baud_rate = cfg.baud_rate,
            "serial port opened with DTR/RTS deasserted"
        );
        Ok(Self {
            port_name: cfg.port.clone(),
            port: Some(port),
        })
    }
}

impl FrameSink for SerialLink {
    fn write_frame(&mut self, frame: &str) -> Result<(), TransportError> {
        let Some(port) = self.port.as_mut() else {
            return Err(TransportError::Closed);
        };
        port.write_all(frame.as_bytes())
            .and_then(|_| port.flush())
            .map_err(classify_write_error)
    }

    fn close(&mut self) {
        if let Some(port) = self.port.take() {
            drop(port);
            info!(port = %self.port_name, "serial port closed");
        }
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.close();
    }
}

pub fn classify_write_error(err: io::Error) -> TransportError {
    if is_device_gone(&err) {
        TransportError::LinkLost(err)
    } else {
        TransportError::Write(err)
    }
}

fn is_device_gone(err: &io::Error) -> bool {
    use io::ErrorKind::*;
    if matches!(
        err.kind(),
        BrokenPipe
            | NotConnected
            | ConnectionAborted
            | ConnectionReset
            | UnexpectedEof
            | NotFound
            | PermissionDenied
    ) {
        return true;
    }

    // Unplugged adapters surface as plain OS errors on most drivers.
    #[cfg(unix)]
    const GONE: &[i32] = &[5 /* EIO */, 6 /* ENXIO */, 19 /* ENODEV */];
    #[cfg(windows)]
    const GONE: &[i32] = &[22, 31, 1167];
    #[cfg(not(any(unix, windows)))]
    const GONE: &[i32] = &[];

    err.raw_os_error().is_some_and(|code| GONE.contains(&code))
}

#[derive(Debug, Clone)]
pub struct PortListing {
    pub name: String,
    pub kind: String,
}

pub fn list_ports() -> Result<Vec<PortListing>, serialport::Error> {
    let ports = serialport::available_ports()?;
    debug!(count = ports.len(), "enumerated serial ports");
    Ok(ports
        .into_iter()
        .map(|p| PortListing {
            name: p.port_name,
            kind: match p.port_type {
                SerialPortType::UsbPort(usb) => format!(
                    "usb {:04x}:{:04x} {}",
                    usb.vid,
                    usb.pid,
                    usb.product.unwrap_or_default()
                ),
                SerialPortType::PciPort => "pci".to_string(),
                SerialPortType::BluetoothPort => "bluetooth".to_string(),
                SerialPortType::Unknown => "unknown".to_string(),
            },
        })
        .collect())
}
