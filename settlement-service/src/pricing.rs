use crate::models::{CartItem, LineItem};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

/// Largest gap tolerated between a caller-claimed total and the recomputed one.
pub const TOTAL_TOLERANCE: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CartError {
    #[error("Cart is empty")]
    EmptyCart,

    #[error("Invalid cart item at position {0}")]
    InvalidItem(usize),

    #[error("Order total must be positive")]
    InvalidTotal,
}

impl CartError {
    pub fn code(&self) -> &'static str {
        match self {
            CartError::EmptyCart => "EMPTY_CART",
            CartError::InvalidItem(_) => "INVALID_ITEM",
            CartError::InvalidTotal => "INVALID_TOTAL",
        }
    }
}

/// Validated cart: line snapshots plus the server-trusted total.
#[derive(Debug, Clone, PartialEq)]
pub struct PricedCart {
    pub items: Vec<LineItem>,
    pub total: i64,
}

/// Recompute the order total from client line items.
///
/// This is the only source of truth for an order's total. Arithmetic is done
/// in `Decimal` and the sum is rounded half away from zero to whole currency
/// units.
pub fn price_cart(items: &[CartItem]) -> Result<PricedCart, CartError> {
    if items.is_empty() {
        return Err(CartError::EmptyCart);
    }

    let mut sum = Decimal::ZERO;
    let mut lines = Vec::with_capacity(items.len());

    for (index, item) in items.iter().enumerate() {
        let invalid = || CartError::InvalidItem(index);

        let price = item
            .price
            .filter(|p| p.is_finite())
            .and_then(Decimal::from_f64)
            .ok_or_else(invalid)?;
        let qty = item
            .qty
            .filter(|q| q.is_finite() && *q > 0.0 && q.fract() == 0.0 && *q <= u32::MAX as f64)
            .ok_or_else(invalid)? as u32;

        let line_total = price
            .checked_mul(Decimal::from(qty))
            .ok_or_else(invalid)?;
        sum = sum.checked_add(line_total).ok_or(CartError::InvalidTotal)?;

        lines.push(LineItem {
            product_id: item.product_id.clone(),
            name: item.name.clone(),
            price,
            qty,
            image: item.image.clone(),
        });
    }

    let total = sum
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or(CartError::InvalidTotal)?;
    if total <= 0 {
        return Err(CartError::InvalidTotal);
    }

    Ok(PricedCart { items: lines, total })
}

/// Whether a caller-supplied total agrees with the recomputed one.
pub fn total_matches(claimed: f64, computed: i64) -> bool {
    match Decimal::from_f64(claimed) {
        Some(claimed) => (claimed - Decimal::from(computed)).abs() <= Decimal::from(TOTAL_TOLERANCE),
        None => false,
    }
}
