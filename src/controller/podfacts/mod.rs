//! Pod-fact engine
//!
//! Collects, per cluster scope, what is known about every pod slot of every
//! subcluster: whether the pod exists and runs, whether Vertica is installed
//! there, whether it holds a catalog and whether its node is up.

mod collect;
mod deployment;
mod fact;
mod gather;
mod node_details;
mod query;


pub use deployment::{Deployment, NodeDetailsSource};
pub use fact::{OverrideFn, PodFact, PodFacts};
pub use gather::{gen_gather_script, GatherState, GatherTarget};
pub use node_details::{
    HttpsNodeDetailsFetcher, NodeDetails, NodeDetailsFetcher, VsqlNodeDetailsFetcher,
};
pub use query::{gen_pod_names, host_and_pod_name_list, DbCheck};
