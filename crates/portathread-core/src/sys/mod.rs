//! Native substrate: alertable waits and OS scheduling calls.

pub(crate) mod priority;
pub(crate) mod wait;
