//! Package-database listers.
//!
//! - `dpkg` - Debian status file (`var/lib/dpkg/status`)
//! - `conda_meta` - conda `conda-meta/*.json` manifests
//! - `conda_list` - `conda list --json` output per environment

pub mod conda_list;
pub mod conda_meta;
pub mod dpkg;

pub use conda_list::{CondaListLister, InventoryCommand, ProcessCommand};
pub use conda_meta::CondaMetaLister;
pub use dpkg::DpkgLister;
