use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::{Clock, Discount, PromoCode, PromoRedemption};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{BookingError, PromoRejection};
use crate::store::{Store, StoreTx};

/// Checks a code against everything except capacity-style limits that only
/// matter at redemption time. `current_uses` is read, never written.
pub async fn validate_in<T: StoreTx>(
    tx: &mut T,
    code: &str,
    event_id: Uuid,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Discount, BookingError> {
    let code = PromoCode::normalize_code(code);
    let promo = tx
        .promo_code(&code)
        .await?
        .ok_or(PromoRejection::NotFound)?;

    check(&promo, event_id, now)?;
    if promo.is_exhausted() {
        return Err(PromoRejection::UsageLimitReached.into());
    }
    if tx.count_promo_redemptions(&promo.code, user_id).await? >= i64::from(promo.max_uses_per_user) {
        return Err(PromoRejection::PerUserLimitReached.into());
    }

    Ok(promo.discount())
}

fn check(promo: &PromoCode, event_id: Uuid, now: DateTime<Utc>) -> Result<(), PromoRejection> {
    if !promo.is_active {
        return Err(PromoRejection::Inactive);
    }
    if now < promo.valid_from {
        return Err(PromoRejection::NotYetValid);
    }
    if now > promo.valid_until {
        return Err(PromoRejection::Expired);
    }
    if !promo.applies_to(event_id) {
        return Err(PromoRejection::NotApplicableToEvent);
    }
    Ok(())
}

/// Consumes one use of `code` on behalf of `booking_id`.
///
/// Locks the code row for the rest of the transaction, so the per-user count
/// and the global counter are checked against the same state. Redeeming for a
/// booking that already holds a redemption is a no-op.
pub async fn redeem_in<T: StoreTx>(
    tx: &mut T,
    code: &str,
    user_id: Uuid,
    booking_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), BookingError> {
    let code = PromoCode::normalize_code(code);
    let promo = tx
        .lock_promo_code(&code)
        .await?
        .ok_or(PromoRejection::NotFound)?;

    if tx.promo_redemption_for_booking(booking_id).await?.is_some() {
        debug!(%booking_id, code = %promo.code, "Promo already redeemed for booking");
        return Ok(());
    }

    if tx.count_promo_redemptions(&promo.code, user_id).await? >= i64::from(promo.max_uses_per_user) {
        return Err(PromoRejection::PerUserLimitReached.into());
    }

    if !tx.try_increment_promo_uses(&promo.code).await? {
        return Err(PromoRejection::UsageLimitReached.into());
    }

    tx.insert_promo_redemption(&PromoRedemption {
        id: Uuid::new_v4(),
        code: promo.code.clone(),
        user_id,
        booking_id,
        redeemed_at: now,
    })
    .await?;

    info!(%booking_id, code = %promo.code, "Promo code redeemed");
    Ok(())
}

pub struct PromoCodeValidator<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for PromoCodeValidator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<S: Store> PromoCodeValidator<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Advisory check for fast feedback; does not hold a usage slot.
    pub async fn validate(
        &self,
        code: &str,
        event_id: Uuid,
        user_id: Uuid,
    ) -> Result<Discount, BookingError> {
        let mut tx = self.store.begin().await?;
        validate_in(&mut tx, code, event_id, user_id, self.clock.now()).await
    }

    pub async fn redeem(&self, code: &str, user_id: Uuid, booking_id: Uuid) -> Result<(), BookingError> {
        let mut tx = self.store.begin().await?;
        redeem_in(&mut tx, code, user_id, booking_id, self.clock.now()).await?;
        tx.commit().await?;
        Ok(())
    }
}
