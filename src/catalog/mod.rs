// Catalog snapshot model, installed-state records and version resolution.

pub mod model;
pub mod resolver;

pub use model::{
    CatalogAddon, CatalogPatch, CatalogSnapshot, CatalogVersion, FileManifestEntry,
    InstalledAddon, InstalledTitle, Platform,
};
