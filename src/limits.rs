//! Input and resource limits enforced at the engine boundary.

use crate::model::Minutes;

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_EMAIL_LEN: usize = 255;
pub const MIN_PHONE_LEN: usize = 10;
pub const MAX_PHONE_LEN: usize = 20;
pub const MAX_VEHICLE_FIELD_LEN: usize = 50;
pub const MIN_VEHICLE_YEAR: i32 = 1900;
pub const MAX_NOTES_LEN: usize = 1000;

pub const MAX_SERVICE_NAME_LEN: usize = 100;
pub const MAX_SERVICE_DURATION: Minutes = 8 * 60;
pub const MAX_SERVICES: usize = 500;
pub const MAX_SERVICES_PER_APPOINTMENT: usize = 20;

pub const MAX_APPOINTMENTS_PER_DAY: usize = 200;

/// Length of a customer-facing confirmation code.
pub const CONFIRMATION_CODE_LEN: usize = 8;
/// Attempts at drawing an unused confirmation code before giving up.
pub const MAX_CODE_ATTEMPTS: usize = 16;
