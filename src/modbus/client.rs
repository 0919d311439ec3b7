//! Modbus transport client.
//!
//! One client per endpoint, three transports behind one surface: TCP,
//! RTU-over-gateway, and RTU-direct serial. Connections are lazy — the
//! pool creates clients cold and the first operation dials. Every call
//! carries a 3 s timeout; transport failures and device exception codes
//! are classified separately because only the former are retried and only
//! the former cascade to the device's remaining registers.

use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};
use tokio_modbus::client::{rtu, tcp, Client, Context, Reader, Writer};
use tokio_modbus::slave::SlaveContext;
use tokio_modbus::Slave;
use tokio_serial::SerialStream;
use tracing::debug;

use crate::config::{Parity, RegisterKind, Transport};
use crate::errors::{ControllerError, Result};

const MODBUS_TIMEOUT: Duration = Duration::from_secs(3);

pub struct ModbusClient {
    transport: Transport,
    ctx: Option<Context>,
}

impl ModbusClient {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            ctx: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    pub fn endpoint(&self) -> String {
        self.transport.endpoint_key()
    }

    async fn connect(&mut self) -> Result<()> {
        match &self.transport {
            Transport::Tcp { host, port } => {
                let addr = lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|e| ControllerError::communication(format!("resolve {host}: {e}")))?
                    .next()
                    .ok_or_else(|| {
                        ControllerError::communication(format!("no address for {host}"))
                    })?;
                let ctx = tokio::time::timeout(MODBUS_TIMEOUT, tcp::connect(addr))
                    .await
                    .map_err(|_| ControllerError::communication(format!("connect timeout: {addr}")))?
                    .map_err(|e| ControllerError::communication(format!("connect {addr}: {e}")))?;
                debug!(endpoint = %self.endpoint(), "modbus tcp connected");
                self.ctx = Some(ctx);
            }
            Transport::RtuGateway { host, port } => {
                let addr = lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|e| ControllerError::communication(format!("resolve {host}: {e}")))?
                    .next()
                    .ok_or_else(|| {
                        ControllerError::communication(format!("no address for {host}"))
                    })?;
                let stream = tokio::time::timeout(MODBUS_TIMEOUT, TcpStream::connect(addr))
                    .await
                    .map_err(|_| ControllerError::communication(format!("connect timeout: {addr}")))?
                    .map_err(|e| ControllerError::communication(format!("connect {addr}: {e}")))?;
                let ctx = rtu::attach_slave(stream, Slave(1));
                debug!(endpoint = %self.endpoint(), "modbus rtu-over-tcp connected");
                self.ctx = Some(ctx);
            }
            Transport::RtuDirect {
                serial_port,
                baudrate,
                parity,
                stopbits,
            } => {
                let mut builder = tokio_serial::new(serial_port, *baudrate);
                builder = match parity.unwrap_or(Parity::None) {
                    Parity::None => builder.parity(tokio_serial::Parity::None),
                    Parity::Even => builder.parity(tokio_serial::Parity::Even),
                    Parity::Odd => builder.parity(tokio_serial::Parity::Odd),
                };
                builder = match stopbits {
                    2 => builder.stop_bits(tokio_serial::StopBits::Two),
                    _ => builder.stop_bits(tokio_serial::StopBits::One),
                };
                builder = builder.timeout(MODBUS_TIMEOUT);

                let stream = SerialStream::open(&builder).map_err(|e| {
                    ControllerError::communication(format!("open {serial_port}: {e}"))
                })?;
                debug!(endpoint = %self.endpoint(), baudrate, "modbus rtu serial opened");
                self.ctx = Some(rtu::attach(stream));
            }
        }
        Ok(())
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.ctx.is_none() {
            self.connect().await?;
        }
        Ok(())
    }

    /// Drop the connection so the next operation redials. Serial ports
    /// hold exclusive OS locks, so a stale client never self-heals — the
    /// pool calls this when a serial device is declared unreachable.
    pub async fn disconnect(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            let _ = ctx.disconnect().await;
        }
    }

    fn ctx_for(&mut self, slave: u8) -> Result<&mut Context> {
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| ControllerError::communication("not connected"))?;
        ctx.set_slave(Slave(slave));
        Ok(ctx)
    }

    /// Map the nested tokio-modbus result into the error taxonomy: outer
    /// errors are transport-class, inner exception codes are
    /// register-class.
    fn classify<T>(
        endpoint: &str,
        outcome: std::result::Result<
            std::result::Result<T, tokio_modbus::ExceptionCode>,
            tokio_modbus::Error,
        >,
    ) -> Result<T> {
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(exception)) => Err(ControllerError::register(format!(
                "{endpoint}: exception {exception}"
            ))),
            Err(e) => Err(ControllerError::communication(format!("{endpoint}: {e}"))),
        }
    }

    /// Read `count` registers of the given kind. Virtual registers never
    /// reach the wire.
    pub async fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        count: u16,
        slave: u8,
    ) -> Result<Vec<u16>> {
        if kind == RegisterKind::Virtual {
            return Err(ControllerError::register(
                "virtual registers are not readable over modbus",
            ));
        }

        self.ensure_connected().await?;
        let endpoint = self.endpoint();
        let ctx = self.ctx_for(slave)?;

        let call = async {
            match kind {
                RegisterKind::Holding => ctx.read_holding_registers(address, count).await,
                _ => ctx.read_input_registers(address, count).await,
            }
        };

        let outcome = match tokio::time::timeout(MODBUS_TIMEOUT, call).await {
            Ok(outcome) => outcome,
            Err(_) => {
                // A timed-out connection is in an unknown framing state.
                self.ctx = None;
                return Err(ControllerError::communication(format!(
                    "{endpoint}: read timeout (reg {address})"
                )));
            }
        };

        match Self::classify(&endpoint, outcome) {
            Ok(words) => Ok(words),
            Err(e) => {
                if e.is_transport() {
                    // Force a redial on the next attempt.
                    self.ctx = None;
                }
                Err(e)
            }
        }
    }

    pub async fn write_register(&mut self, address: u16, value: u16, slave: u8) -> Result<()> {
        self.ensure_connected().await?;
        let endpoint = self.endpoint();
        let ctx = self.ctx_for(slave)?;

        let outcome =
            match tokio::time::timeout(MODBUS_TIMEOUT, ctx.write_single_register(address, value))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.ctx = None;
                    return Err(ControllerError::communication(format!(
                        "{endpoint}: write timeout (reg {address})"
                    )));
                }
            };

        match Self::classify(&endpoint, outcome) {
            Ok(()) => Ok(()),
            Err(e) if e.is_transport() => {
                self.ctx = None;
                Err(e)
            }
            Err(_) => Err(ControllerError::Write {
                register: address,
                value,
                message: format!("{endpoint}: device rejected write"),
            }),
        }
    }

    pub async fn write_registers(&mut self, address: u16, values: &[u16], slave: u8) -> Result<()> {
        self.ensure_connected().await?;
        let endpoint = self.endpoint();
        let ctx = self.ctx_for(slave)?;

        let outcome =
            match tokio::time::timeout(MODBUS_TIMEOUT, ctx.write_multiple_registers(address, values))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.ctx = None;
                    return Err(ControllerError::communication(format!(
                        "{endpoint}: write timeout (reg {address})"
                    )));
                }
            };

        match Self::classify(&endpoint, outcome) {
            Ok(()) => Ok(()),
            Err(e) if e.is_transport() => {
                self.ctx = None;
                Err(e)
            }
            Err(_) => Err(ControllerError::Write {
                register: address,
                value: values.first().copied().unwrap_or(0),
                message: format!("{endpoint}: device rejected write"),
            }),
        }
    }
}
