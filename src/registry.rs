// src/registry.rs - one engine per configured printer
use std::collections::BTreeMap;

use crate::config::{ConnectionType, PrinterConfig, ProtocolConfig};
use crate::printer::{Printer, PrinterError};
use crate::transport::{Connector, MockConnector, MockTransport, SerialConnector};

/// Build the connector a printer entry asks for.
pub fn connector_for(config: &PrinterConfig) -> Box<dyn Connector> {
    match config.connection {
        ConnectionType::Marlin => Box::new(SerialConnector::new(config.port.clone(), config.baud)),
        ConnectionType::Mock => Box::new(MockConnector::new(MockTransport::emulated())),
    }
}

#[derive(Debug, Default)]
pub struct PrinterRegistry {
    printers: BTreeMap<String, Printer>,
    current: Option<String>,
}

impl PrinterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a printer and make it current. Nothing is registered if the
    /// connection fails.
    pub async fn try_add(&mut self, config: &PrinterConfig, protocol: &ProtocolConfig) -> Result<Printer, PrinterError> {
        self.try_add_with(&config.name, protocol, connector_for(config)).await
    }

    pub async fn try_add_with(
        &mut self,
        name: &str,
        protocol: &ProtocolConfig,
        connector: Box<dyn Connector>,
    ) -> Result<Printer, PrinterError> {
        if self.printers.contains_key(name) {
            return Err(PrinterError::InvalidState(format!("printer '{}' already registered", name)));
        }
        let printer = Printer::new(name, protocol.clone(), connector);
        printer.connect().await?;
        tracing::info!("Registered printer '{}'", name);
        self.printers.insert(name.to_string(), printer.clone());
        self.current = Some(name.to_string());
        Ok(printer)
    }

    pub fn get(&self, name: &str) -> Option<&Printer> {
        self.printers.get(name)
    }

    pub fn current(&self) -> Option<&Printer> {
        self.current.as_deref().and_then(|name| self.printers.get(name))
    }

    pub fn set_current(&mut self, name: &str) -> bool {
        if self.printers.contains_key(name) {
            self.current = Some(name.to_string());
            true
        } else {
            false
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.printers.keys().cloned().collect()
    }

    pub async fn shutdown(&mut self) {
        for (name, printer) in &self.printers {
            if let Err(e) = printer.shutdown().await {
                tracing::warn!("Error shutting down '{}': {}", name, e);
            }
        }
        self.printers.clear();
        self.current = None;
    }
}
