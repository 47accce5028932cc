//! Change-event model for the real-time feed.
//!
//! Wire payloads are decoded into [`RawChangeEvent`] and validated exactly once
//! into a [`ChangeEvent`]; everything downstream pattern-matches on
//! [`EntityType`] and [`Operation`].

mod types;

pub use types::{
    record_field, ChangeEvent, EntityType, EventDecodeError, Operation, RawChangeEvent, Record,
};
