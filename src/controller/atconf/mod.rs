//! admintools.conf handling
//!
//! `ini` is the file format layer; `writer` maintains the cluster host list
//! and node slot assignments on top of it.

pub mod ini;
mod writer;

pub use ini::IniFile;
pub use writer::{
    FileWriter, CLUSTER_HOSTS_OPTION, CLUSTER_SECTION, CONFIGURATION_IPV6_OPTION,
    CONFIGURATION_SECTION, DEFAULT_ADMINTOOLS_CONF, NODES_SECTION,
};
