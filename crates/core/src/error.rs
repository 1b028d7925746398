use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("region {region} out of range (configured regions: {regions})")]
    RegionOutOfRange { region: usize, regions: usize },

    #[error("energy level {level} out of range (configured levels: {levels})")]
    EnergyOutOfRange { level: u8, levels: u8 },

    #[error("negative capacity: {0}")]
    NegativeCapacity(i64),
}
