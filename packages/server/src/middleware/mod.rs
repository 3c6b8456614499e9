pub mod org_context;
pub mod request_id;

pub use org_context::OrgContext;
pub use request_id::{request_id_middleware, RequestId};
