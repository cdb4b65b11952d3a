/*! Crate configuration.

A [`CrateConfig`] describes one MVLC controller and everything needed to run
a readout on it: how to connect, the readout stack for each trigger, the
trigger setup, and the command sequences run at DAQ start and stop.

Configs are plain data, created by a configuration front end and read-only
during a readout run. They round-trip through YAML.
*/
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::command::{StackCommandBuilder, stacks};
use crate::transport::ConnectionType;

/// How to reach the controller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Connection {
    /// FTDI USB device, picked by enumeration index or serial string.
    Usb {
        #[serde(skip_serializing_if = "Option::is_none")]
        index: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        serial: Option<String>,
    },
    /// UDP, hostname or dotted address.
    Eth { host: String },
}

impl Default for Connection {
    fn default() -> Self {
        Connection::Usb {
            index: Some(0),
            serial: None,
        }
    }
}

impl Connection {
    #[must_use]
    pub fn connection_type(&self) -> ConnectionType {
        match self {
            Connection::Usb { .. } => ConnectionType::Usb,
            Connection::Eth { .. } => ConnectionType::Eth,
        }
    }
}

/// Trigger condition starting one readout stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trigger {
    /// VME interrupt with IACK cycle. `irq` is the interrupt level, 1..=7.
    IrqWithIack { irq: u8 },
    /// VME interrupt without IACK cycle.
    IrqNoIack { irq: u8 },
    /// External trigger routed through the Trigger/IO unit.
    External,
    /// Periodic execution driven by a Trigger/IO timer.
    Periodic { period_ms: u32 },
}

// Trigger type values of the per-stack trigger register.
const TRIGGER_TYPE_IRQ_WITH_IACK: u16 = 1;
const TRIGGER_TYPE_IRQ_NO_IACK: u16 = 2;
const TRIGGER_TYPE_EXTERNAL: u16 = 3;

impl Trigger {
    /// Value to write into the stack's trigger register.
    ///
    /// IRQ triggers encode the level as `irq - 1` in the trigger bits.
    /// External and periodic triggers are fired through the Trigger/IO unit
    /// and only carry the type.
    #[must_use]
    pub fn register_value(&self) -> u32 {
        let (ty, bits) = match *self {
            Trigger::IrqWithIack { irq } => (TRIGGER_TYPE_IRQ_WITH_IACK, u16::from(irq.saturating_sub(1))),
            Trigger::IrqNoIack { irq } => (TRIGGER_TYPE_IRQ_NO_IACK, u16::from(irq.saturating_sub(1))),
            Trigger::External | Trigger::Periodic { .. } => (TRIGGER_TYPE_EXTERNAL, 0),
        };
        u32::from(ty << stacks::TRIGGER_TYPE_SHIFT | (bits & stacks::TRIGGER_BITS_MASK))
    }
}

/// Full configuration of one crate.
///
/// Invariants checked by [`CrateConfig::validate`]:
/// * one trigger per readout stack,
/// * readout stacks fit into the stack memory area above the immediate
///   stack reservation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CrateConfig {
    /// Controller id, 0..=7. Stamped into readout frames by the MVLC.
    pub crate_id: u8,

    pub connection: Connection,

    /// One readout stack per trigger. Stack memory index `i + 1`; stack 0
    /// is reserved for dialog use.
    pub readout_stacks: Vec<StackCommandBuilder>,

    /// Trigger descriptor for each readout stack.
    pub triggers: Vec<Trigger>,

    /// Module initialization, run before triggers are enabled.
    #[serde(default, skip_serializing_if = "StackCommandBuilder::is_empty")]
    pub init_commands: StackCommandBuilder,

    /// Run after triggers have been disabled at DAQ stop.
    #[serde(default, skip_serializing_if = "StackCommandBuilder::is_empty")]
    pub shutdown_commands: StackCommandBuilder,

    /// Trigger/IO unit setup (timers, gates, NIM routing).
    #[serde(default, skip_serializing_if = "StackCommandBuilder::is_empty")]
    pub trigger_io: StackCommandBuilder,
}

impl CrateConfig {
    #[must_use]
    pub fn connection_type(&self) -> ConnectionType {
        self.connection.connection_type()
    }

    /// Check the structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.readout_stacks.len() != self.triggers.len() {
            return Err(crate::Error::InvalidConfig(format!(
                "{} readout stacks but {} triggers",
                self.readout_stacks.len(),
                self.triggers.len()
            )));
        }

        let max_stacks = (stacks::STACK_COUNT - stacks::FIRST_READOUT_STACK_ID) as usize;
        if self.readout_stacks.len() > max_stacks {
            return Err(crate::Error::InvalidConfig(format!(
                "{} readout stacks, hardware supports {}",
                self.readout_stacks.len(),
                max_stacks
            )));
        }

        Ok(())
    }
}

/// Serialize a config to YAML.
pub fn to_yaml(config: &CrateConfig) -> Result<String> {
    Ok(serde_yaml::to_string(config)?)
}

/// Parse a config from YAML.
pub fn from_yaml(text: &str) -> Result<CrateConfig> {
    Ok(serde_yaml::from_str(text)?)
}
