mod capture;
mod helpers;
mod pending;
mod products;
mod sync;

pub(crate) use capture::{cmd_photo, cmd_weight};
pub(crate) use helpers::parse_item_code;
pub(crate) use pending::cmd_pending;
pub(crate) use products::{cmd_products, cmd_refresh};
pub(crate) use sync::{cmd_sync, cmd_watch};
