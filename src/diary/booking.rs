//! Appointment slot selection and confirmation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain_types::BookingId;

/// A slot offered to the patient, optionally held with a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferedSlot {
    /// Start time of the offered slot.
    pub start: DateTime<Utc>,
    /// Hold reference with the scheduling provider, if a hold was placed.
    pub hold_id: Option<String>,
}

/// A booking the patient previously held and then cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelledBooking {
    /// The booking's identifier at the time it was cancelled.
    pub booking_id: BookingId,
    /// The slot that was cancelled.
    pub slot: DateTime<Utc>,
    /// When the cancellation happened.
    pub cancelled_at: DateTime<Utc>,
}

/// Appointment eligibility, offered/rejected slots, and the final booking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookingSection {
    /// Earliest date the patient is eligible to book.
    pub eligible_from: Option<DateTime<Utc>>,
    /// Latest date the patient is eligible to book.
    pub eligible_until: Option<DateTime<Utc>>,
    /// Slots currently offered to the patient.
    pub offered_slots: Vec<OfferedSlot>,
    /// Slots the patient rejected, for audit/no-repeat purposes.
    pub rejected_slots: Vec<OfferedSlot>,
    /// The slot the patient selected, if any.
    pub selected_slot: Option<DateTime<Utc>>,
    /// Identifier of the confirmed booking.
    pub booking_id: Option<BookingId>,
    /// Instructions to send the patient ahead of the appointment.
    pub pre_appointment_instructions: Option<String>,
    /// `true` once the booking is confirmed with the provider.
    pub confirmed: bool,
    /// History of previously cancelled bookings for this patient.
    pub cancelled_bookings: Vec<CancelledBooking>,
}

impl BookingSection {
    /// Moves the current booking into history and clears the active slot.
    pub fn cancel_current(&mut self) {
        if let (Some(booking_id), Some(slot)) = (self.booking_id.take(), self.selected_slot.take()) {
            self.cancelled_bookings.push(CancelledBooking {
                booking_id,
                slot,
                cancelled_at: Utc::now(),
            });
        }
        self.confirmed = false;
    }
}
