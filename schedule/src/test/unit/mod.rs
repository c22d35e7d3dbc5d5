//! Unit tests spanning several modules: full searches and materialized
//! schedules.

mod materialize;
mod search;
