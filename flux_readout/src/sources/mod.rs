//! Concrete equipment sources.
//!
//! Sources implement [`EquipmentSource`](crate::equipment::EquipmentSource)
//! and are created by name through [`create_source`]; hardware DMA and
//! network sources live outside this crate and plug in through the same
//! trait.

pub mod dummy;
pub mod emulator;
pub mod player;

pub use dummy::DummyGenerator;
pub use emulator::CruEmulator;
pub use player::FilePlayer;

use flux_common::config::{EquipmentConfig, GlobalConfig};
use flux_memory::MemoryBankManager;

use crate::equipment::{EquipmentSource, ReadoutEquipment};
use crate::error::ReadoutError;

/// Instantiate the source named by `equipment_type`.
pub fn create_source(cfg: &EquipmentConfig) -> Result<Box<dyn EquipmentSource>, ReadoutError> {
    match cfg.equipment_type.as_str() {
        "dummy" => Ok(Box::new(DummyGenerator::from_config(cfg)?)),
        "player" => Ok(Box::new(FilePlayer::from_config(cfg)?)),
        "emulator" => Ok(Box::new(CruEmulator::from_config(cfg)?)),
        other => Err(ReadoutError::Config(format!(
            "unknown equipment_type '{other}'"
        ))),
    }
}

/// Build a complete equipment (source + pool + FIFO) from configuration.
pub fn equipment_from_config(
    cfg: &EquipmentConfig,
    global: &GlobalConfig,
    manager: &MemoryBankManager,
    index: usize,
) -> Result<ReadoutEquipment, ReadoutError> {
    let source = create_source(cfg)?;
    ReadoutEquipment::new(cfg, global, manager, source, index)
}
