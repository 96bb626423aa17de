//! The bookings table with transactional outbox co-writes.

use crate::outbox_store::insert_outbox;
use crate::store_err;
use async_trait::async_trait;
use booking_rush_core::{
    Booking, BookingId, BookingStatus, BookingStore, BookingUpdate, EventId, Money,
    NewOutboxMessage, Page, PaymentId, ShowId, StoreError, UserId, ZoneId, ZoneKey, ZoneUsage,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// `PostgreSQL` booking store. Every mutation co-writes its outbox event in
/// the same transaction, the outbox invariant in one place.
pub struct PostgresBookingStore {
    pool: PgPool,
}

impl PostgresBookingStore {
    /// Creates a store over the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_booking(row: &PgRow) -> Result<Booking, StoreError> {
        let status: String = row.try_get("status").map_err(store_err)?;
        let quantity: i32 = row.try_get("quantity").map_err(store_err)?;
        let quantity = u32::try_from(quantity)
            .map_err(|_| StoreError::Serialization("negative quantity".to_string()))?;

        Ok(Booking {
            booking_id: BookingId::from_uuid(
                row.try_get::<Uuid, _>("booking_id").map_err(store_err)?,
            ),
            user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id").map_err(store_err)?),
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id").map_err(store_err)?),
            show_id: ShowId::from_uuid(row.try_get::<Uuid, _>("show_id").map_err(store_err)?),
            zone_id: ZoneId::from_uuid(row.try_get::<Uuid, _>("zone_id").map_err(store_err)?),
            quantity,
            unit_price: Money::from_cents(row.try_get("unit_price").map_err(store_err)?),
            total_price: Money::from_cents(row.try_get("total_price").map_err(store_err)?),
            currency: row.try_get("currency").map_err(store_err)?,
            status: BookingStatus::parse(&status)?,
            idempotency_key: row.try_get("idempotency_key").map_err(store_err)?,
            reserved_at: row.try_get("reserved_at").map_err(store_err)?,
            expires_at: row.try_get("expires_at").map_err(store_err)?,
            confirmed_at: row.try_get("confirmed_at").map_err(store_err)?,
            cancelled_at: row.try_get("cancelled_at").map_err(store_err)?,
            payment_id: row
                .try_get::<Option<String>, _>("payment_id")
                .map_err(store_err)?
                .map(PaymentId::new),
            confirmation_code: row.try_get("confirmation_code").map_err(store_err)?,
        })
    }
}

const BOOKING_COLUMNS: &str = "booking_id, user_id, event_id, show_id, zone_id, quantity, \
     unit_price, total_price, currency, status, idempotency_key, reserved_at, expires_at, \
     confirmed_at, cancelled_at, payment_id, confirmation_code";

#[async_trait]
impl BookingStore for PostgresBookingStore {
    async fn insert_reserved(
        &self,
        booking: &Booking,
        outbox: NewOutboxMessage,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        sqlx::query(
            r"
            INSERT INTO bookings (
                booking_id, user_id, event_id, show_id, zone_id, quantity,
                unit_price, total_price, currency, status, idempotency_key,
                reserved_at, expires_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ",
        )
        .bind(booking.booking_id.as_uuid())
        .bind(booking.user_id.as_uuid())
        .bind(booking.event_id.as_uuid())
        .bind(booking.show_id.as_uuid())
        .bind(booking.zone_id.as_uuid())
        .bind(i32::try_from(booking.quantity).unwrap_or(i32::MAX))
        .bind(booking.unit_price.cents())
        .bind(booking.total_price.cents())
        .bind(&booking.currency)
        .bind(booking.status.as_str())
        .bind(&booking.idempotency_key)
        .bind(booking.reserved_at)
        .bind(booking.expires_at)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        insert_outbox(&mut tx, &outbox).await.map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;

        tracing::debug!(booking_id = %booking.booking_id, "booking inserted with outbox event");
        Ok(())
    }

    async fn transition(
        &self,
        booking_id: BookingId,
        expected: BookingStatus,
        update: BookingUpdate,
        outbox: NewOutboxMessage,
    ) -> Result<Booking, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let updated = match &update {
            BookingUpdate::Confirm {
                payment_id,
                confirmation_code,
                at,
            } => sqlx::query(&format!(
                r"
                UPDATE bookings
                SET status = 'confirmed', confirmed_at = $3, payment_id = $4,
                    confirmation_code = $5
                WHERE booking_id = $1 AND status = $2
                RETURNING {BOOKING_COLUMNS}
                "
            ))
            .bind(booking_id.as_uuid())
            .bind(expected.as_str())
            .bind(at)
            .bind(payment_id.as_ref().map(PaymentId::as_str))
            .bind(confirmation_code)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_err)?,
            BookingUpdate::Cancel { at } => sqlx::query(&format!(
                r"
                UPDATE bookings
                SET status = 'cancelled', cancelled_at = $3
                WHERE booking_id = $1 AND status = $2
                RETURNING {BOOKING_COLUMNS}
                "
            ))
            .bind(booking_id.as_uuid())
            .bind(expected.as_str())
            .bind(at)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_err)?,
            BookingUpdate::Expire => sqlx::query(&format!(
                r"
                UPDATE bookings
                SET status = 'expired'
                WHERE booking_id = $1 AND status = $2
                RETURNING {BOOKING_COLUMNS}
                "
            ))
            .bind(booking_id.as_uuid())
            .bind(expected.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_err)?,
        };

        let Some(row) = updated else {
            // Distinguish a missing booking from one in another state.
            let current: Option<String> =
                sqlx::query_scalar("SELECT status FROM bookings WHERE booking_id = $1")
                    .bind(booking_id.as_uuid())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(store_err)?;
            return Err(match current {
                Some(actual) => StoreError::Conflict(actual),
                None => StoreError::NotFound,
            });
        };

        insert_outbox(&mut tx, &outbox).await.map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;

        Self::row_to_booking(&row)
    }

    async fn fetch(&self, booking_id: BookingId) -> Result<Option<Booking>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE booking_id = $1"
        ))
        .bind(booking_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        row.as_ref().map(Self::row_to_booking).transpose()
    }

    async fn list_for_user(
        &self,
        user_id: UserId,
        page: Page,
    ) -> Result<Vec<Booking>, StoreError> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {BOOKING_COLUMNS} FROM bookings
            WHERE user_id = $1
            ORDER BY reserved_at DESC
            LIMIT $2 OFFSET $3
            "
        ))
        .bind(user_id.as_uuid())
        .bind(i64::from(page.per_page))
        .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter().map(Self::row_to_booking).collect()
    }

    async fn quota_used(&self, user_id: UserId, event_id: EventId) -> Result<u32, StoreError> {
        let used: i64 = sqlx::query_scalar(
            r"
            SELECT COALESCE(SUM(quantity), 0)::BIGINT
            FROM bookings
            WHERE user_id = $1 AND event_id = $2
              AND status IN ('reserved', 'confirmed')
            ",
        )
        .bind(user_id.as_uuid())
        .bind(event_id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;

        u32::try_from(used).map_err(|_| StoreError::Serialization("quota overflow".to_string()))
    }

    async fn due_expirations(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Booking>, StoreError> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {BOOKING_COLUMNS} FROM bookings
            WHERE status = 'reserved' AND expires_at <= $1
            ORDER BY expires_at ASC
            LIMIT $2
            ",
        ))
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter().map(Self::row_to_booking).collect()
    }

    async fn zone_usage(&self) -> Result<Vec<ZoneUsage>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT show_id, zone_id,
                SUM(CASE WHEN status = 'reserved' AND expires_at > now()
                    THEN quantity ELSE 0 END)::BIGINT AS active_reserved,
                SUM(CASE WHEN status = 'confirmed'
                    THEN quantity ELSE 0 END)::BIGINT AS sold
            FROM bookings
            GROUP BY show_id, zone_id
            ",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter()
            .map(|row| {
                let show_id: Uuid = row.try_get("show_id").map_err(store_err)?;
                let zone_id: Uuid = row.try_get("zone_id").map_err(store_err)?;
                let active_reserved: i64 = row.try_get("active_reserved").map_err(store_err)?;
                let sold: i64 = row.try_get("sold").map_err(store_err)?;
                Ok(ZoneUsage {
                    zone: ZoneKey::new(ShowId::from_uuid(show_id), ZoneId::from_uuid(zone_id)),
                    active_reserved: u32::try_from(active_reserved).unwrap_or(0),
                    sold: u32::try_from(sold).unwrap_or(0),
                })
            })
            .collect()
    }
}
