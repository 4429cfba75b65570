//! Constant-product pool state applier
//!
//! Pure function from (decoded AMM event, in-memory pool reserves) to the
//! next reserves plus the rows the event derives: trade, liquidity snapshot,
//! candle update, and spot sample. All arithmetic is exact fixed-18 integer
//! math; reserve subtraction saturates at zero.

use crate::chain::events::AmmEvent;
use crate::models::{
    fixed18_to_decimal, CandleRow, LiquidityEventRow, LiquidityKind, SpotPointRow, TradeRow,
    TradeSide, SCALE,
};
use alloy_primitives::U256;
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

/// Per-pool working set. Hydrated from the latest liquidity snapshot at the
/// start of each job; private to the job that loaded it.
#[derive(Debug, Clone)]
pub struct PoolState {
    pub market_id: Uuid,
    pub fpmm_address: String,
    pub yes_reserve: U256,
    pub no_reserve: U256,
    pub last_block: u64,
    pub last_log_index: u64,
    pub has_liquidity: bool,
}

impl PoolState {
    pub fn new(market_id: Uuid, fpmm_address: &str) -> Self {
        Self {
            market_id,
            fpmm_address: fpmm_address.to_lowercase(),
            yes_reserve: U256::ZERO,
            no_reserve: U256::ZERO,
            last_block: 0,
            last_log_index: 0,
            has_liquidity: false,
        }
    }

    /// True when the event position has already been applied to this state
    pub fn already_applied(&self, block: u64, log_index: u64) -> bool {
        (block, log_index) <= (self.last_block, self.last_log_index)
            && (self.last_block, self.last_log_index) != (0, 0)
    }
}

/// Where an event sits on chain, plus its block time
#[derive(Debug, Clone)]
pub struct EventPosition {
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
}

/// Rows derived from applying one event
#[derive(Debug, Clone)]
pub struct Applied {
    pub trade: Option<TradeRow>,
    pub liquidity: LiquidityEventRow,
    pub candle: Option<CandleRow>,
    pub spot: Option<SpotPointRow>,
}

/// `max(a - b, 0)`
pub fn sub_floor(a: U256, b: U256) -> U256 {
    a.saturating_sub(b)
}

fn scale() -> U256 {
    U256::from(SCALE)
}

/// Spot YES price at fixed-18: `no * SCALE / (yes + no)`, 0 for an empty pool
pub fn yes_price_scaled(yes: U256, no: U256) -> U256 {
    let total = yes.saturating_add(no);
    if total.is_zero() {
        U256::ZERO
    } else {
        no.saturating_mul(scale()) / total
    }
}

/// Pool TVL at fixed-18: each side valued at its spot price
pub fn tvl_scaled(yes: U256, no: U256) -> U256 {
    let yes_price = yes_price_scaled(yes, no);
    let no_price = sub_floor(scale(), yes_price);
    yes.saturating_mul(yes_price) / scale() + no.saturating_mul(no_price) / scale()
}

/// Fixed-18 execution price: `amount * SCALE / shares`, 0 when shares = 0
pub fn price_fixed(amount: U256, shares: U256) -> U256 {
    if shares.is_zero() {
        U256::ZERO
    } else {
        amount.saturating_mul(scale()) / shares
    }
}

/// Wall-clock aligned 5-minute bucket
pub fn bucket_start(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    let secs = timestamp.timestamp();
    let floored = secs - secs.rem_euclid(300);
    Utc.timestamp_opt(floored, 0).single().unwrap_or(timestamp)
}

/// Apply one in-order event to the pool state, producing the next state in
/// place and the derived rows. Requires `(block, log_index)` ascending
/// delivery; callers sort and skip already-applied positions.
pub fn apply(state: &mut PoolState, event: &AmmEvent, position: &EventPosition) -> Applied {
    let had_liquidity = state.has_liquidity;
    let mut trade = None;
    let mut candle = None;
    let mut spot = None;

    let kind = match event {
        AmmEvent::FundingAdded { amounts } => {
            state.yes_reserve = state.yes_reserve.saturating_add(amounts[0]);
            state.no_reserve = state.no_reserve.saturating_add(amounts[1]);
            if had_liquidity {
                LiquidityKind::Add
            } else {
                LiquidityKind::Init
            }
        }
        AmmEvent::FundingRemoved { amounts } => {
            state.yes_reserve = sub_floor(state.yes_reserve, amounts[0]);
            state.no_reserve = sub_floor(state.no_reserve, amounts[1]);
            LiquidityKind::Remove
        }
        AmmEvent::Buy {
            investment,
            fee,
            outcome,
            shares,
        } => {
            let net = sub_floor(*investment, *fee);
            if *outcome == 0 {
                state.no_reserve = state.no_reserve.saturating_add(net);
                state.yes_reserve = sub_floor(state.yes_reserve, *shares);
            } else {
                state.yes_reserve = state.yes_reserve.saturating_add(net);
                state.no_reserve = sub_floor(state.no_reserve, *shares);
            }
            trade = Some(trade_row(
                state,
                position,
                TradeSide::Buy,
                *outcome,
                *investment,
                *shares,
                *fee,
            ));
            (candle, spot) = trade_marks(state, position, *investment);
            LiquidityKind::Trade
        }
        AmmEvent::Sell {
            return_amount,
            fee,
            outcome,
            shares,
        } => {
            let gross = return_amount.saturating_add(*fee);
            if *outcome == 0 {
                state.yes_reserve = state.yes_reserve.saturating_add(*shares);
                state.no_reserve = sub_floor(state.no_reserve, gross);
            } else {
                state.no_reserve = state.no_reserve.saturating_add(*shares);
                state.yes_reserve = sub_floor(state.yes_reserve, gross);
            }
            trade = Some(trade_row(
                state,
                position,
                TradeSide::Sell,
                *outcome,
                *return_amount,
                *shares,
                *fee,
            ));
            (candle, spot) = trade_marks(state, position, *return_amount);
            LiquidityKind::Trade
        }
    };

    state.has_liquidity = !state.yes_reserve.is_zero() || !state.no_reserve.is_zero();
    state.last_block = position.block_number;
    state.last_log_index = position.log_index;

    let liquidity = LiquidityEventRow {
        market_id: state.market_id,
        fpmm_address: state.fpmm_address.clone(),
        tx_hash: position.tx_hash.clone(),
        log_index: position.log_index as i64,
        block_number: position.block_number as i64,
        timestamp: position.timestamp,
        kind: kind.to_string(),
        yes_reserves: fixed18_to_decimal(state.yes_reserve),
        no_reserves: fixed18_to_decimal(state.no_reserve),
        tvl_usdf: fixed18_to_decimal(tvl_scaled(state.yes_reserve, state.no_reserve)),
        source: None,
    };

    Applied {
        trade,
        liquidity,
        candle,
        spot,
    }
}

#[allow(clippy::too_many_arguments)]
fn trade_row(
    state: &PoolState,
    position: &EventPosition,
    side: TradeSide,
    outcome: u8,
    amount_in: U256,
    shares: U256,
    fee: U256,
) -> TradeRow {
    TradeRow {
        market_id: state.market_id,
        fpmm_address: state.fpmm_address.clone(),
        tx_hash: position.tx_hash.clone(),
        log_index: position.log_index as i64,
        block_number: position.block_number as i64,
        timestamp: position.timestamp,
        side: side.to_string(),
        outcome: i32::from(outcome),
        amount_in_usdf: fixed18_to_decimal(amount_in),
        price: fixed18_to_decimal(price_fixed(amount_in, shares)),
        amount_out_shares: fixed18_to_decimal(shares),
        fee_usdf: Some(fixed18_to_decimal(fee)),
    }
}

/// Candle update and spot sample marked at the post-trade spot price
fn trade_marks(
    state: &PoolState,
    position: &EventPosition,
    volume: U256,
) -> (Option<CandleRow>, Option<SpotPointRow>) {
    let yes_price = yes_price_scaled(state.yes_reserve, state.no_reserve);
    let price = fixed18_to_decimal(yes_price);
    let candle = CandleRow {
        market_id: state.market_id,
        bucket_start: bucket_start(position.timestamp),
        open: price.clone(),
        high: price.clone(),
        low: price.clone(),
        close: price.clone(),
        volume_usdf: fixed18_to_decimal(volume),
    };
    let spot = SpotPointRow {
        market_id: state.market_id,
        timestamp: position.timestamp,
        yes_price: price,
        no_price: fixed18_to_decimal(sub_floor(scale(), yes_price)),
    };
    (Some(candle), Some(spot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::decimal_to_fixed18;

    const ONE: u64 = 1_000_000_000_000_000_000;

    fn one() -> U256 {
        U256::from(ONE)
    }

    fn tokens(n: u64) -> U256 {
        U256::from(n) * one()
    }

    fn position(block: u64, log_index: u64, secs: i64) -> EventPosition {
        EventPosition {
            tx_hash: "0xabc".to_string(),
            log_index,
            block_number: block,
            timestamp: Utc.timestamp_opt(secs, 0).single().unwrap(),
        }
    }

    fn seeded_state() -> PoolState {
        let mut state = PoolState::new(Uuid::new_v4(), "0xAA00000000000000000000000000000000000001");
        let funding = AmmEvent::FundingAdded {
            amounts: [tokens(100), tokens(100)],
        };
        apply(&mut state, &funding, &position(10, 0, 1_700_000_000));
        state
    }

    #[test]
    fn first_funding_is_init_then_add() {
        let mut state = PoolState::new(Uuid::new_v4(), "0xaa");
        let funding = AmmEvent::FundingAdded {
            amounts: [tokens(100), tokens(100)],
        };

        let first = apply(&mut state, &funding, &position(10, 0, 1_700_000_000));
        assert_eq!(first.liquidity.kind, "init");
        assert!(first.trade.is_none());
        assert!(first.candle.is_none());

        let second = apply(&mut state, &funding, &position(11, 0, 1_700_000_060));
        assert_eq!(second.liquidity.kind, "add");
        assert_eq!(state.yes_reserve, tokens(200));
        assert_eq!(state.no_reserve, tokens(200));
    }

    #[test]
    fn buy_yes_moves_reserves_and_derives_rows() {
        let mut state = seeded_state();
        let shares = U256::from(990_099_009_900_990_099u64);
        let buy = AmmEvent::Buy {
            investment: one(),
            fee: U256::ZERO,
            outcome: 0,
            shares,
        };

        let applied = apply(&mut state, &buy, &position(10, 1, 1_700_000_010));

        assert_eq!(state.no_reserve, tokens(101));
        assert_eq!(state.yes_reserve, tokens(100) - shares);

        let trade = applied.trade.unwrap();
        assert_eq!(trade.side, "buy");
        assert_eq!(trade.outcome, 0);
        assert_eq!(decimal_to_fixed18(&trade.amount_in_usdf), one());
        assert_eq!(
            decimal_to_fixed18(&trade.price),
            price_fixed(one(), shares)
        );

        // Candle closes at post-trade spot no/(yes+no)
        let candle = applied.candle.unwrap();
        let expected_spot = yes_price_scaled(state.yes_reserve, state.no_reserve);
        assert_eq!(decimal_to_fixed18(&candle.close), expected_spot);
        assert_eq!(decimal_to_fixed18(&candle.volume_usdf), one());

        // Liquidity snapshot carries the same position and post-trade TVL
        assert_eq!(applied.liquidity.kind, "trade");
        assert_eq!(
            decimal_to_fixed18(&applied.liquidity.tvl_usdf),
            tvl_scaled(state.yes_reserve, state.no_reserve)
        );
    }

    #[test]
    fn buy_no_mirrors_sides() {
        let mut state = seeded_state();
        let buy = AmmEvent::Buy {
            investment: tokens(2),
            fee: U256::ZERO,
            outcome: 1,
            shares: one(),
        };
        apply(&mut state, &buy, &position(10, 1, 1_700_000_010));
        assert_eq!(state.yes_reserve, tokens(102));
        assert_eq!(state.no_reserve, tokens(99));
    }

    #[test]
    fn buy_fee_reduces_net_investment() {
        let mut state = seeded_state();
        let buy = AmmEvent::Buy {
            investment: tokens(10),
            fee: one(),
            outcome: 0,
            shares: one(),
        };
        apply(&mut state, &buy, &position(10, 1, 1_700_000_010));
        // net = 10 - 1 flows into the NO side
        assert_eq!(state.no_reserve, tokens(109));
        assert_eq!(state.yes_reserve, tokens(99));
    }

    #[test]
    fn sell_yes_pays_out_gross_from_no_side() {
        let mut state = seeded_state();
        let sell = AmmEvent::Sell {
            return_amount: tokens(2),
            fee: one(),
            outcome: 0,
            shares: tokens(4),
        };
        let applied = apply(&mut state, &sell, &position(10, 1, 1_700_000_010));

        assert_eq!(state.yes_reserve, tokens(104));
        assert_eq!(state.no_reserve, tokens(97));

        let trade = applied.trade.unwrap();
        assert_eq!(trade.side, "sell");
        assert_eq!(decimal_to_fixed18(&trade.amount_in_usdf), tokens(2));
        // price = return / shares = 0.5
        assert_eq!(decimal_to_fixed18(&trade.price), one() / U256::from(2u64));
        // candle volume = returnAmount, not gross
        assert_eq!(
            decimal_to_fixed18(&applied.candle.unwrap().volume_usdf),
            tokens(2)
        );
    }

    #[test]
    fn funding_removed_saturates_at_zero() {
        let mut state = seeded_state();
        let remove = AmmEvent::FundingRemoved {
            amounts: [tokens(500), tokens(50)],
        };
        let applied = apply(&mut state, &remove, &position(11, 0, 1_700_000_300));
        assert_eq!(state.yes_reserve, U256::ZERO);
        assert_eq!(state.no_reserve, tokens(50));
        assert_eq!(applied.liquidity.kind, "remove");
    }

    #[test]
    fn zero_shares_trade_has_zero_price() {
        assert_eq!(price_fixed(one(), U256::ZERO), U256::ZERO);
    }

    #[test]
    fn spot_price_stays_in_unit_interval() {
        let cases = [
            (U256::ZERO, U256::ZERO),
            (tokens(1), U256::ZERO),
            (U256::ZERO, tokens(1)),
            (tokens(3), tokens(7)),
            (tokens(1_000_000), one()),
        ];
        for (yes, no) in cases {
            let price = yes_price_scaled(yes, no);
            assert!(price <= U256::from(SCALE), "price out of range for {yes}/{no}");
            if price == U256::from(SCALE) {
                assert!(yes.is_zero());
            }
        }
    }

    #[test]
    fn spot_sample_prices_sum_to_one() {
        let mut state = seeded_state();
        let buy = AmmEvent::Buy {
            investment: one(),
            fee: U256::ZERO,
            outcome: 0,
            shares: one(),
        };
        let applied = apply(&mut state, &buy, &position(10, 1, 1_700_000_010));
        let spot = applied.spot.unwrap();
        let total =
            decimal_to_fixed18(&spot.yes_price) + decimal_to_fixed18(&spot.no_price);
        assert_eq!(total, U256::from(SCALE));
    }

    #[test]
    fn tvl_matches_reserve_identity() {
        let yes = tokens(99);
        let no = tokens(101);
        let yes_price = yes_price_scaled(yes, no);
        let expected = yes * yes_price / U256::from(SCALE)
            + no * (U256::from(SCALE) - yes_price) / U256::from(SCALE);
        assert_eq!(tvl_scaled(yes, no), expected);
    }

    #[test]
    fn bucket_start_floors_to_five_minutes() {
        let ts = Utc.timestamp_opt(1_700_000_123, 0).single().unwrap();
        let bucket = bucket_start(ts);
        assert_eq!(bucket.timestamp() % 300, 0);
        assert!(bucket <= ts);
        assert!(ts.timestamp() - bucket.timestamp() < 300);
    }

    #[test]
    fn watermark_detects_already_applied_positions() {
        let state = seeded_state();
        assert!(state.already_applied(10, 0));
        assert!(state.already_applied(9, 5));
        assert!(!state.already_applied(10, 1));
        assert!(!state.already_applied(11, 0));
    }
}
