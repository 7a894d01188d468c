//! Connector for the physical rig behind one GPIB controller.

use crate::config::{InstrumentsConfig, SourceKind};
use crate::hardware::ami430::Ami430;
use crate::hardware::capabilities::{
    CurrentSource, LockInAmplifier, LockInWithOutputs, Rig, RigConnector,
};
use crate::hardware::dsp7265::Dsp7265;
use crate::hardware::gpib::{GpibInstrument, PrologixController};
use crate::hardware::sm7045d::Sm7045d;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Opens the GPIB controller and builds the three instrument drivers.
#[derive(Debug, Clone)]
pub struct GpibRig {
    config: InstrumentsConfig,
}

impl GpibRig {
    /// Connector for the instruments described by `config`.
    pub fn new(config: InstrumentsConfig) -> Self {
        Self { config }
    }

    /// Build the drivers on an already opened controller.
    pub async fn attach(&self, bus: Arc<PrologixController>) -> Result<Rig> {
        bus.initialize().await?;

        let cfg = &self.config;
        let lockin1: Arc<dyn LockInWithOutputs> = Arc::new(Dsp7265::new(GpibInstrument::new(
            bus.clone(),
            cfg.lockin1_address,
            "DSP7265 #1",
        )));
        let lockin2: Arc<dyn LockInAmplifier> = Arc::new(Dsp7265::new(GpibInstrument::new(
            bus.clone(),
            cfg.lockin2_address,
            "DSP7265 #2",
        )));
        let source = self.source(bus);

        info!(
            lockin1 = cfg.lockin1_address,
            lockin2 = cfg.lockin2_address,
            source = cfg.source.address,
            kind = ?cfg.source.kind,
            "Instruments attached"
        );
        Ok(Rig {
            lockin1,
            lockin2,
            source,
        })
    }

    fn source(&self, bus: Arc<PrologixController>) -> Arc<dyn CurrentSource> {
        let cfg = &self.config.source;
        match cfg.kind {
            SourceKind::Sm7045d => Arc::new(self.supply(bus)),
            SourceKind::Ami430 => Arc::new(self.magnet(bus)),
        }
    }

    /// SM7045D driver configured from the source settings.
    pub fn supply(&self, bus: Arc<PrologixController>) -> Sm7045d<GpibInstrument> {
        let cfg = &self.config.source;
        Sm7045d::new(GpibInstrument::new(bus, cfg.address, "SM7045D"))
            .with_ramp_interval(Duration::from_millis(cfg.ramp_interval_ms))
            .with_compliance_voltage(cfg.compliance_voltage)
    }

    /// AMI430 driver configured from the source settings.
    pub fn magnet(&self, bus: Arc<PrologixController>) -> Ami430<GpibInstrument> {
        let cfg = &self.config.source;
        Ami430::new(GpibInstrument::new(bus, cfg.address, "AMI430"))
            .with_poll_interval(Duration::from_millis(cfg.poll_interval_ms))
            .with_ramp_timeout(Duration::from_secs(cfg.ramp_timeout_secs))
    }

    /// Open the serial GPIB controller named in the configuration.
    #[cfg(feature = "instrument_serial")]
    pub fn open_bus(&self) -> Result<Arc<PrologixController>> {
        let bus = PrologixController::open_serial(&self.config.port, self.config.baud_rate)?
            .with_timeout(self.config.timeout());
        Ok(Arc::new(bus))
    }
}

#[async_trait]
impl RigConnector for GpibRig {
    async fn connect(&self) -> Result<Rig> {
        #[cfg(feature = "instrument_serial")]
        {
            info!(port = %self.config.port, "Opening GPIB controller");
            let bus = self.open_bus()?;
            self.attach(bus).await
        }
        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(anyhow::anyhow!(crate::error::SweepError::Configuration(
                "built without the instrument_serial feature; only --mock is available".into()
            )))
        }
    }
}
