mod group;
mod pool;
mod recovery;
mod revalidate;

pub use group::{AggregateMember, Group, GroupId, HeaderRule};
pub use pool::{
    AcquireError, CredentialId, CredentialPool, CredentialStatus, CredentialView,
    LeasedCredential,
};
pub use revalidate::{
    KeyValidator, RevalidationConfig, run_revalidation_pass, spawn_revalidation_task,
};
