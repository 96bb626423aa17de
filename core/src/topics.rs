//! Bus topic names. The names are part of the contract.

/// Booking lifecycle events emitted through the outbox
/// (`booking.reserved`, `booking.confirmed`, `booking.cancelled`,
/// `booking.expired`, `booking.compensated`), partitioned by booking id.
pub const BOOKING_EVENTS: &str = "booking.events";

/// Dead-letter topic for messages that exhausted their retries.
pub const DLQ: &str = "saga.booking.dlq";

/// Saga step command topics, consumed by the step workers.
pub mod commands {
    /// Reserve seats for a booking.
    pub const RESERVE_SEATS: &str = "saga.booking.reserve-seats.command";
    /// Charge the payment for a booking.
    pub const PROCESS_PAYMENT: &str = "saga.booking.process-payment.command";
    /// Confirm a paid booking.
    pub const CONFIRM_BOOKING: &str = "saga.booking.confirm-booking.command";
    /// Notify the user of the outcome.
    pub const NOTIFY: &str = "saga.booking.notify.command";
    /// Compensation: return held seats to the pool.
    pub const RELEASE_SEATS: &str = "saga.booking.release-seats.command";
    /// Compensation: refund a captured payment.
    pub const REFUND_PAYMENT: &str = "saga.booking.refund-payment.command";
    /// Compensation: retract a sent notification.
    pub const CANCEL_NOTIFICATION: &str = "saga.booking.cancel-notification.command";

    /// Every command topic, for worker subscription.
    pub const ALL: &[&str] = &[
        RESERVE_SEATS,
        PROCESS_PAYMENT,
        CONFIRM_BOOKING,
        NOTIFY,
        RELEASE_SEATS,
        REFUND_PAYMENT,
        CANCEL_NOTIFICATION,
    ];
}

/// Saga step event topics, consumed by the orchestrator.
pub mod events {
    /// Seats were reserved.
    pub const SEATS_RESERVED: &str = "saga.booking.seats-reserved.event";
    /// Seat reservation failed.
    pub const SEATS_RESERVATION_FAILED: &str = "saga.booking.seats-reservation-failed.event";
    /// Payment captured.
    pub const PAYMENT_PROCESSED: &str = "saga.booking.payment-processed.event";
    /// Payment declined or errored.
    pub const PAYMENT_FAILED: &str = "saga.booking.payment-failed.event";
    /// Booking confirmed durably.
    pub const BOOKING_CONFIRMED: &str = "saga.booking.booking-confirmed.event";
    /// Booking confirmation failed.
    pub const BOOKING_CONFIRM_FAILED: &str = "saga.booking.booking-confirm-failed.event";
    /// Notification delivered.
    pub const NOTIFICATION_SENT: &str = "saga.booking.notification-sent.event";
    /// Seats returned to the pool (compensation acknowledged).
    pub const SEATS_RELEASED: &str = "saga.booking.seats-released.event";
    /// Payment refunded (compensation acknowledged).
    pub const PAYMENT_REFUNDED: &str = "saga.booking.payment-refunded.event";
    /// Notification retracted (compensation acknowledged).
    pub const NOTIFICATION_CANCELLED: &str = "saga.booking.notification-cancelled.event";
    /// A booking saga completed all compensations after a failure.
    pub const BOOKING_COMPENSATED: &str = "saga.booking.booking-compensated.event";
    /// Saga lifecycle: started.
    pub const SAGA_STARTED: &str = "saga.booking.saga-started.event";
    /// Saga lifecycle: completed.
    pub const SAGA_COMPLETED: &str = "saga.booking.saga-completed.event";
    /// Saga lifecycle: failed.
    pub const SAGA_FAILED: &str = "saga.booking.saga-failed.event";

    /// Every step event topic, for orchestrator subscription.
    pub const ALL_STEP_EVENTS: &[&str] = &[
        SEATS_RESERVED,
        SEATS_RESERVATION_FAILED,
        PAYMENT_PROCESSED,
        PAYMENT_FAILED,
        BOOKING_CONFIRMED,
        BOOKING_CONFIRM_FAILED,
        NOTIFICATION_SENT,
        SEATS_RELEASED,
        PAYMENT_REFUNDED,
        NOTIFICATION_CANCELLED,
    ];
}
