//! Hard bounds on client-supplied input.

pub const MIN_PHONE_LEN: usize = 10;
pub const MAX_PHONE_LEN: usize = 32;
pub const MAX_NAME_LEN: usize = 100;
pub const MAX_SERVICE_LEN: usize = 100;

