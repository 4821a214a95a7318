//! Custom Resource Definitions for the Vertica operator
//!
//! This module defines the VerticaDB CRD and the spec/status types the
//! controller reads.

pub mod types;
mod vertica_db;


pub use types::*;
pub use vertica_db::{
    VerticaDB, VerticaDBSpec, VerticaDBStatus, DEFAULT_SUPERUSER, INSTALLER_INDICATOR_FILE_PREFIX,
    SUPERUSER_NAME_ANNOTATION, VCLUSTER_OPS_ANNOTATION, VERSION_ANNOTATION,
};
