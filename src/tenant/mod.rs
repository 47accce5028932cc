//! Tenant scoping for change events.
//!
//! Most records carry their tenant id directly. Some (assignments, bids,
//! compliance items) only reference a parent record, so their tenant is found
//! by following a chain of foreign keys:
//!
//! - assignment → job via `job_id`
//! - bid → opportunity via `opportunity_id`
//! - compliance item → contract via `contract_id`
//!
//! Resolutions are cached for a short TTL since bursts of events referencing
//! the same parent are common.

mod filter;
mod rules;

pub use filter::{TenantFilter, TenantResolution};
pub use rules::{LookupRuleError, LookupRules, TenantLookupRule};
