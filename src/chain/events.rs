//! AMM pool event decoding
//!
//! The four reserve-moving events a fixed-product pool emits, decoded by
//! topic-0 from hand-written ABI word reads. Unknown topics are inert: the
//! decoder returns `None` and the caller moves on. Extending the recognized
//! set means adding a variant here and a case in `decode_amm_event`.

use super::types::LogEntry;
use alloy_primitives::{keccak256, B256, U256};
use std::sync::OnceLock;

/// Canonical event signatures of the two-outcome fixed-product pool
const SIG_FUNDING_ADDED: &[u8] = b"FPMMFundingAdded(address,uint256[],uint256)";
const SIG_FUNDING_REMOVED: &[u8] = b"FPMMFundingRemoved(address,uint256[],uint256,uint256)";
const SIG_BUY: &[u8] = b"FPMMBuy(address,uint256,uint256,uint256,uint256)";
const SIG_SELL: &[u8] = b"FPMMSell(address,uint256,uint256,uint256,uint256)";

/// Pool-creation event emitted by the market factory
const SIG_POOL_CREATED: &[u8] =
    b"FixedProductMarketMakerCreation(address,address,address,address,bytes32[],uint256)";

fn topic(sig: &'static [u8], slot: &'static OnceLock<B256>) -> B256 {
    *slot.get_or_init(|| keccak256(sig))
}

pub fn topic_funding_added() -> B256 {
    static T: OnceLock<B256> = OnceLock::new();
    topic(SIG_FUNDING_ADDED, &T)
}

pub fn topic_funding_removed() -> B256 {
    static T: OnceLock<B256> = OnceLock::new();
    topic(SIG_FUNDING_REMOVED, &T)
}

pub fn topic_buy() -> B256 {
    static T: OnceLock<B256> = OnceLock::new();
    topic(SIG_BUY, &T)
}

pub fn topic_sell() -> B256 {
    static T: OnceLock<B256> = OnceLock::new();
    topic(SIG_SELL, &T)
}

pub fn topic_pool_created() -> B256 {
    static T: OnceLock<B256> = OnceLock::new();
    topic(SIG_POOL_CREATED, &T)
}

/// Closed sum type over the recognized AMM events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmmEvent {
    /// Funding added to the pool; `amounts` are per-outcome [YES, NO]
    FundingAdded { amounts: [U256; 2] },
    /// Funding removed from the pool
    FundingRemoved { amounts: [U256; 2] },
    /// Collateral in, outcome shares out
    Buy {
        investment: U256,
        fee: U256,
        outcome: u8,
        shares: U256,
    },
    /// Outcome shares in, collateral out
    Sell {
        return_amount: U256,
        fee: U256,
        outcome: u8,
        shares: U256,
    },
}

/// Read the `i`-th 32-byte word of ABI-encoded data
fn word(data: &[u8], index: usize) -> Option<U256> {
    let start = index.checked_mul(32)?;
    let end = start.checked_add(32)?;
    data.get(start..end).map(U256::from_be_slice)
}

/// Read a dynamic `uint256[]` whose offset lives in head word `head_index`,
/// requiring exactly two elements (one per outcome).
fn uint_pair_at(data: &[u8], head_index: usize) -> Option<[U256; 2]> {
    let offset = word(data, head_index)?;
    let offset: usize = offset.try_into().ok()?;
    if offset % 32 != 0 {
        return None;
    }
    let base = offset / 32;
    let len: usize = word(data, base)?.try_into().ok()?;
    if len != 2 {
        return None;
    }
    Some([word(data, base + 1)?, word(data, base + 2)?])
}

/// Indexed outcome slot from a topic; only 0 (YES) and 1 (NO) are valid
fn outcome_from_topic(topic: &B256) -> Option<u8> {
    let value = U256::from_be_slice(topic.as_slice());
    match u8::try_from(value) {
        Ok(v @ 0..=1) => Some(v),
        _ => None,
    }
}

/// Decode one log into an AMM event. Returns `None` for unknown topics and
/// for recognized topics whose payload does not decode (the caller logs and
/// skips those).
pub fn decode_amm_event(log: &LogEntry) -> Option<AmmEvent> {
    let topic0 = log.topics.first()?;
    let data: &[u8] = &log.data;

    if *topic0 == topic_funding_added() {
        // FPMMFundingAdded(address indexed funder, uint256[] amountsAdded,
        //                  uint256 sharesMinted)
        let amounts = uint_pair_at(data, 0)?;
        Some(AmmEvent::FundingAdded { amounts })
    } else if *topic0 == topic_funding_removed() {
        // FPMMFundingRemoved(address indexed funder, uint256[] amountsRemoved,
        //                    uint256 collateralRemovedFromFeePool,
        //                    uint256 sharesBurnt)
        let amounts = uint_pair_at(data, 0)?;
        Some(AmmEvent::FundingRemoved { amounts })
    } else if *topic0 == topic_buy() {
        // FPMMBuy(address indexed buyer, uint256 investmentAmount,
        //         uint256 feeAmount, uint256 indexed outcomeIndex,
        //         uint256 outcomeTokensBought)
        let outcome = outcome_from_topic(log.topics.get(2)?)?;
        Some(AmmEvent::Buy {
            investment: word(data, 0)?,
            fee: word(data, 1)?,
            outcome,
            shares: word(data, 2)?,
        })
    } else if *topic0 == topic_sell() {
        // FPMMSell(address indexed seller, uint256 returnAmount,
        //          uint256 feeAmount, uint256 indexed outcomeIndex,
        //          uint256 outcomeTokensSold)
        let outcome = outcome_from_topic(log.topics.get(2)?)?;
        Some(AmmEvent::Sell {
            return_amount: word(data, 0)?,
            fee: word(data, 1)?,
            outcome,
            shares: word(data, 2)?,
        })
    } else {
        None
    }
}

/// Extract the pool address from a factory creation log. The new pool is the
/// first data word (the creation event's only non-indexed address).
pub fn decode_created_pool(log: &LogEntry) -> Option<alloy_primitives::Address> {
    if *log.topics.first()? != topic_pool_created() {
        return None;
    }
    let w = word(&log.data, 0)?;
    let bytes: [u8; 32] = w.to_be_bytes::<32>();
    Some(alloy_primitives::Address::from_slice(&bytes[12..]))
}

#[cfg(any(test, feature = "mock-chain"))]
pub mod test_support {
    //! Builders for synthetic pool logs used across the test suite

    use super::*;
    use crate::chain::types::LogEntry;
    use alloy_primitives::{Address, Bytes};

    pub fn encode_word(value: U256) -> [u8; 32] {
        value.to_be_bytes::<32>()
    }

    pub fn topic_word(value: u64) -> B256 {
        B256::from(U256::from(value).to_be_bytes::<32>())
    }

    fn log(address: Address, topics: Vec<B256>, data: Vec<u8>, block: u64, index: u64) -> LogEntry {
        LogEntry {
            address,
            topics,
            data: Bytes::from(data),
            block_number: block,
            block_hash: B256::repeat_byte(0xbb),
            transaction_hash: B256::repeat_byte(0xcc),
            log_index: index,
            removed: false,
        }
    }

    /// Re-home a built log onto a specific block and transaction
    pub fn relocate(log: &mut LogEntry, block_hash: B256, tx_hash: B256, block: u64) {
        log.block_hash = block_hash;
        log.transaction_hash = tx_hash;
        log.block_number = block;
    }

    pub fn funding_added_log(
        address: Address,
        yes: U256,
        no: U256,
        block: u64,
        index: u64,
    ) -> LogEntry {
        // head: [offset=0x40, sharesMinted], tail: [len=2, yes, no]
        let mut data = Vec::new();
        data.extend_from_slice(&encode_word(U256::from(0x40u64)));
        data.extend_from_slice(&encode_word(U256::ZERO));
        data.extend_from_slice(&encode_word(U256::from(2u64)));
        data.extend_from_slice(&encode_word(yes));
        data.extend_from_slice(&encode_word(no));
        log(
            address,
            vec![topic_funding_added(), B256::repeat_byte(0x01)],
            data,
            block,
            index,
        )
    }

    pub fn funding_removed_log(
        address: Address,
        yes: U256,
        no: U256,
        block: u64,
        index: u64,
    ) -> LogEntry {
        // head: [offset=0x60, collateralRemoved, sharesBurnt], tail: [2, yes, no]
        let mut data = Vec::new();
        data.extend_from_slice(&encode_word(U256::from(0x60u64)));
        data.extend_from_slice(&encode_word(U256::ZERO));
        data.extend_from_slice(&encode_word(U256::ZERO));
        data.extend_from_slice(&encode_word(U256::from(2u64)));
        data.extend_from_slice(&encode_word(yes));
        data.extend_from_slice(&encode_word(no));
        log(
            address,
            vec![topic_funding_removed(), B256::repeat_byte(0x01)],
            data,
            block,
            index,
        )
    }

    pub fn buy_log(
        address: Address,
        investment: U256,
        fee: U256,
        outcome: u64,
        shares: U256,
        block: u64,
        index: u64,
    ) -> LogEntry {
        let mut data = Vec::new();
        data.extend_from_slice(&encode_word(investment));
        data.extend_from_slice(&encode_word(fee));
        data.extend_from_slice(&encode_word(shares));
        log(
            address,
            vec![topic_buy(), B256::repeat_byte(0x01), topic_word(outcome)],
            data,
            block,
            index,
        )
    }

    pub fn sell_log(
        address: Address,
        return_amount: U256,
        fee: U256,
        outcome: u64,
        shares: U256,
        block: u64,
        index: u64,
    ) -> LogEntry {
        let mut data = Vec::new();
        data.extend_from_slice(&encode_word(return_amount));
        data.extend_from_slice(&encode_word(fee));
        data.extend_from_slice(&encode_word(shares));
        log(
            address,
            vec![topic_sell(), B256::repeat_byte(0x01), topic_word(outcome)],
            data,
            block,
            index,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use alloy_primitives::Address;

    const ONE: u64 = 1_000_000_000_000_000_000;

    #[test]
    fn decodes_funding_added_with_dynamic_array() {
        let log = funding_added_log(
            Address::repeat_byte(0xaa),
            U256::from(100u64) * U256::from(ONE),
            U256::from(100u64) * U256::from(ONE),
            10,
            0,
        );
        let event = decode_amm_event(&log).unwrap();
        assert_eq!(
            event,
            AmmEvent::FundingAdded {
                amounts: [
                    U256::from(100u64) * U256::from(ONE),
                    U256::from(100u64) * U256::from(ONE),
                ]
            }
        );
    }

    #[test]
    fn decodes_buy_with_indexed_outcome() {
        let log = buy_log(
            Address::repeat_byte(0xaa),
            U256::from(ONE),
            U256::ZERO,
            1,
            U256::from(990_099_000_000_000_000u64),
            10,
            1,
        );
        match decode_amm_event(&log).unwrap() {
            AmmEvent::Buy {
                investment,
                fee,
                outcome,
                shares,
            } => {
                assert_eq!(investment, U256::from(ONE));
                assert_eq!(fee, U256::ZERO);
                assert_eq!(outcome, 1);
                assert_eq!(shares, U256::from(990_099_000_000_000_000u64));
            }
            other => panic!("expected buy, got {other:?}"),
        }
    }

    #[test]
    fn decodes_sell_and_funding_removed() {
        let sell = sell_log(
            Address::repeat_byte(0xaa),
            U256::from(ONE),
            U256::from(ONE / 100),
            0,
            U256::from(2u64) * U256::from(ONE),
            12,
            3,
        );
        assert!(matches!(
            decode_amm_event(&sell),
            Some(AmmEvent::Sell { outcome: 0, .. })
        ));

        let removed = funding_removed_log(
            Address::repeat_byte(0xaa),
            U256::from(ONE),
            U256::from(ONE),
            13,
            0,
        );
        assert!(matches!(
            decode_amm_event(&removed),
            Some(AmmEvent::FundingRemoved { .. })
        ));
    }

    #[test]
    fn unknown_topics_are_inert() {
        let mut log = buy_log(
            Address::repeat_byte(0xaa),
            U256::from(ONE),
            U256::ZERO,
            0,
            U256::from(ONE),
            10,
            1,
        );
        log.topics[0] = B256::repeat_byte(0xee);
        assert_eq!(decode_amm_event(&log), None);
    }

    #[test]
    fn out_of_range_outcome_is_rejected() {
        let log = buy_log(
            Address::repeat_byte(0xaa),
            U256::from(ONE),
            U256::ZERO,
            3,
            U256::from(ONE),
            10,
            1,
        );
        assert_eq!(decode_amm_event(&log), None);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut log = funding_added_log(
            Address::repeat_byte(0xaa),
            U256::from(ONE),
            U256::from(ONE),
            10,
            0,
        );
        let truncated = log.data[..64].to_vec();
        log.data = truncated.into();
        assert_eq!(decode_amm_event(&log), None);
    }
}
