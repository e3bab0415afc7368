// Store operations, one module per table group.  Queries are runtime-bound
// so the crate builds without a live database.

pub mod chats;
pub mod messages;
pub mod sessions;
pub mod status;
pub mod users;
