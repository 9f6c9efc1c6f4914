use std::path::PathBuf;

/// Scratch folder for demo data
pub const TEMP_PATH: &str = "./temp";

/// Default folder for local exports and their previews
pub const DATA_PATH: &str = "./data";

/// Default manifest name of an on-disk catalog
pub const CATALOG_MANIFEST: &str = "catalog.json";

pub fn get_temp_path() -> PathBuf {
    PathBuf::from(TEMP_PATH)
}

pub fn get_data_path() -> PathBuf {
    PathBuf::from(DATA_PATH)
}
