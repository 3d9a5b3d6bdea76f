use crate::limits::*;
use crate::model::*;

use super::EngineError;
use super::booking::BookingRequest;

fn reject(msg: impl Into<String>) -> EngineError {
    EngineError::Validation(msg.into())
}

fn required(value: &str, max: usize, what: &str) -> Result<(), EngineError> {
    if value.is_empty() {
        return Err(reject(format!("{what} is required")));
    }
    if value.chars().count() > max {
        return Err(reject(format!("{what} must be at most {max} characters")));
    }
    Ok(())
}

/// Loose shape check: one `@`, non-empty local part, dotted domain, no whitespace.
pub(crate) fn is_well_formed_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains("..")
}

/// Trim every text field and check them in form order. The first failure wins.
pub(crate) fn normalize_booking(
    req: BookingRequest,
    current_year: i32,
) -> Result<BookingRequest, EngineError> {
    let customer = Customer {
        name: req.customer.name.trim().to_string(),
        email: req.customer.email.trim().to_string(),
        phone: req.customer.phone.trim().to_string(),
    };
    let vehicle = Vehicle {
        make: req.vehicle.make.trim().to_string(),
        model: req.vehicle.model.trim().to_string(),
        year: req.vehicle.year,
    };
    let notes = req
        .notes
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());

    required(&customer.name, MAX_NAME_LEN, "Name")?;
    if !is_well_formed_email(&customer.email) {
        return Err(reject("Invalid email address"));
    }
    if customer.email.chars().count() > MAX_EMAIL_LEN {
        return Err(reject(format!("Email must be at most {MAX_EMAIL_LEN} characters")));
    }
    let phone_len = customer.phone.chars().count();
    if phone_len < MIN_PHONE_LEN {
        return Err(reject(format!(
            "Phone number must be at least {MIN_PHONE_LEN} digits"
        )));
    }
    if phone_len > MAX_PHONE_LEN {
        return Err(reject(format!(
            "Phone number must be at most {MAX_PHONE_LEN} characters"
        )));
    }
    required(&vehicle.make, MAX_VEHICLE_FIELD_LEN, "Car make")?;
    required(&vehicle.model, MAX_VEHICLE_FIELD_LEN, "Car model")?;
    if vehicle.year < MIN_VEHICLE_YEAR || vehicle.year > current_year + 1 {
        return Err(reject(format!(
            "Invalid year: must be between {MIN_VEHICLE_YEAR} and {}",
            current_year + 1
        )));
    }
    if let Some(n) = &notes
        && n.chars().count() > MAX_NOTES_LEN
    {
        return Err(reject(format!("Notes must be at most {MAX_NOTES_LEN} characters")));
    }

    if req.service_ids.is_empty() {
        return Err(reject("Please select at least one service"));
    }
    if req.service_ids.len() > MAX_SERVICES_PER_APPOINTMENT {
        return Err(EngineError::LimitExceeded("too many services on one appointment"));
    }
    let mut service_ids = Vec::with_capacity(req.service_ids.len());
    for id in req.service_ids {
        if !service_ids.contains(&id) {
            service_ids.push(id);
        }
    }

    Ok(BookingRequest {
        customer,
        vehicle,
        date: req.date,
        time: req.time,
        service_ids,
        notes,
    })
}

pub(crate) fn validate_service(name: &str, duration: Minutes) -> Result<(), EngineError> {
    required(name, MAX_SERVICE_NAME_LEN, "Service name")?;
    if duration == 0 || duration > MAX_SERVICE_DURATION {
        return Err(reject(format!(
            "Service duration must be between 1 and {MAX_SERVICE_DURATION} minutes"
        )));
    }
    Ok(())
}
