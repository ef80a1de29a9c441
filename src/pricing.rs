use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::model::{Span, HOUR_MS};

/// Currency precision: amounts are kept to two decimal places.
const MONEY_DP: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub subtotal_room: Decimal,
    pub subtotal_snack: Decimal,
    pub total: Decimal,
}

fn money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_DP, RoundingStrategy::MidpointAwayFromZero)
}

/// Fractional hours covered by `span`.
pub fn duration_hours(span: &Span) -> Decimal {
    Decimal::from(span.duration_ms()) / Decimal::from(HOUR_MS)
}

/// `rate × hours + snack × participants`. A booking without a snack passes zero.
pub fn price(
    room_rate: Decimal,
    duration_hours: Decimal,
    snack_unit_price: Decimal,
    participants: u32,
) -> PriceBreakdown {
    breakdown(room_rate * duration_hours, snack_unit_price, participants)
}

/// Same as [`price`], but multiplies by the millisecond duration before
/// dividing so a 20-minute booking doesn't pick up a repeating third.
pub fn price_span(
    room_rate: Decimal,
    span: &Span,
    snack_unit_price: Decimal,
    participants: u32,
) -> PriceBreakdown {
    let room = room_rate * Decimal::from(span.duration_ms()) / Decimal::from(HOUR_MS);
    breakdown(room, snack_unit_price, participants)
}

fn breakdown(room: Decimal, snack_unit_price: Decimal, participants: u32) -> PriceBreakdown {
    let subtotal_room = money(room);
    let subtotal_snack = money(snack_unit_price * Decimal::from(participants));
    PriceBreakdown {
        subtotal_room,
        subtotal_snack,
        total: subtotal_room + subtotal_snack,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: i64 = 60_000;

    #[test]
    fn two_hours_with_snacks() {
        let p = price(
            Decimal::from(100_000),
            Decimal::from(2),
            Decimal::from(50_000),
            5,
        );
        assert_eq!(p.subtotal_room, Decimal::from(200_000));
        assert_eq!(p.subtotal_snack, Decimal::from(250_000));
        assert_eq!(p.total, Decimal::from(450_000));
    }

    #[test]
    fn no_snack_costs_nothing_extra() {
        let p = price(Decimal::from(75_000), Decimal::from(3), Decimal::ZERO, 12);
        assert_eq!(p.subtotal_snack, Decimal::ZERO);
        assert_eq!(p.total, Decimal::from(225_000));
    }

    #[test]
    fn fractional_hours_are_billed() {
        let span = Span::new(0, 90 * M);
        assert_eq!(duration_hours(&span), Decimal::new(15, 1));
        let p = price_span(Decimal::from(100_000), &span, Decimal::ZERO, 1);
        assert_eq!(p.subtotal_room, Decimal::from(150_000));
    }

    #[test]
    fn twenty_minutes_round_to_cents() {
        let span = Span::new(0, 20 * M);
        let p = price_span(Decimal::from(100), &span, Decimal::ZERO, 1);
        assert_eq!(p.subtotal_room, Decimal::new(3333, 2));

        let p = price_span(Decimal::from(200), &span, Decimal::ZERO, 1);
        assert_eq!(p.subtotal_room, Decimal::new(6667, 2));
    }

    #[test]
    fn span_and_hours_agree_on_whole_hours() {
        let span = Span::new(0, 2 * HOUR_MS);
        let by_span = price_span(Decimal::from(100_000), &span, Decimal::from(50_000), 5);
        let by_hours = price(
            Decimal::from(100_000),
            duration_hours(&span),
            Decimal::from(50_000),
            5,
        );
        assert_eq!(by_span, by_hours);
    }

    #[test]
    fn total_is_sum_of_subtotals() {
        let span = Span::new(0, 45 * M);
        let p = price_span(Decimal::new(12_550, 2), &span, Decimal::new(1_999, 2), 3);
        assert_eq!(p.total, p.subtotal_room + p.subtotal_snack);
        assert_eq!(p.subtotal_snack, Decimal::new(5_997, 2));
    }
}
