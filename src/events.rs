//! Adapters turning domain events into [`RawInteraction`] streams.
use std::collections::HashMap;

use serde::Deserialize;

use super::data::RawInteraction;
use super::Timestamp;

/// Default width of an activity bucket: four hours.
pub const DEFAULT_BUCKET_WIDTH: i64 = 4 * 60 * 60;

/// A value moved from one account to another.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Transfer {
    /// Sending account.
    pub from: String,
    /// Receiving account.
    pub to: String,
    /// Transferred amount.
    pub amount: f64,
}

/// An account being active at some point in time.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Activity {
    /// The active account.
    pub account: String,
    /// Unix time in seconds.
    pub timestamp: Timestamp,
}

/// Expand undirected pairs into interactions in both directions, each with
/// weight 1.
pub fn symmetric<I, K>(pairs: I) -> Vec<RawInteraction>
where
    I: IntoIterator<Item = (K, K)>,
    K: Into<String>,
{
    pairs
        .into_iter()
        .flat_map(|(a, b)| {
            let (a, b) = (a.into(), b.into());
            vec![
                RawInteraction::new(a.clone(), b.clone(), 1.0),
                RawInteraction::new(b, a, 1.0),
            ]
        })
        .collect()
}

/// Rate how strongly each account is tied to each counterparty, from 1 to 5.
///
/// Transfers are undirected for rating purposes: the pair total sums both
/// directions, and an account's total sums everything it sent or received.
/// The rating is `round(min(pair / (account / 2) * 4, 4) + 1)`, so a
/// counterparty taking half of an account's volume or more rates 5.
/// Interactions come out in the order their pairs were first seen.
pub fn transfer_ratings<I: IntoIterator<Item = Transfer>>(transfers: I) -> Vec<RawInteraction> {
    let mut pair_order: Vec<(String, String)> = Vec::new();
    let mut pair_totals: HashMap<(String, String), f64> = HashMap::new();
    let mut account_totals: HashMap<String, f64> = HashMap::new();

    for transfer in transfers {
        for (user, item) in [
            (&transfer.from, &transfer.to),
            (&transfer.to, &transfer.from),
        ] {
            let key = (user.clone(), item.clone());
            match pair_totals.get_mut(&key) {
                Some(total) => *total += transfer.amount,
                None => {
                    pair_totals.insert(key.clone(), transfer.amount);
                    pair_order.push(key);
                }
            }
            *account_totals.entry(user.clone()).or_insert(0.0) += transfer.amount;
        }
    }

    pair_order
        .into_iter()
        .map(|key| {
            let pair_total = pair_totals.get(&key).copied().unwrap_or(0.0);
            let account_total = account_totals.get(&key.0).copied().unwrap_or(0.0);
            let rating = rating(pair_total, account_total);
            RawInteraction::new(key.0, key.1, rating)
        })
        .collect()
}

fn rating(pair_total: f64, account_total: f64) -> f32 {
    let share = (pair_total / (account_total / 2.0) * 4.0).min(4.0);
    (share + 1.0).round() as f32
}

/// Turn account activity into interactions with time-bucket pseudo-items.
///
/// Each event maps to the item `bucket:<start>`, where `start` is the
/// timestamp floored to a multiple of `width` seconds.
pub fn activity_buckets<I: IntoIterator<Item = Activity>>(
    activity: I,
    width: i64,
    weight: f32,
) -> Vec<RawInteraction> {
    let width = width.max(1);

    activity
        .into_iter()
        .map(|event| {
            let start = event.timestamp.div_euclid(width) * width;
            RawInteraction::new(event.account, bucket_key(start), weight)
                .with_timestamp(event.timestamp)
        })
        .collect()
}

/// The item key of the bucket starting at `start`.
pub fn bucket_key(start: Timestamp) -> String {
    format!("bucket:{}", start)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(from: &str, to: &str, amount: f64) -> Transfer {
        Transfer {
            from: from.to_owned(),
            to: to.to_owned(),
            amount,
        }
    }

    #[test]
    fn symmetric_expansion() {
        let interactions = symmetric(vec![("a", "b"), ("a", "c")]);

        let pairs: Vec<_> = interactions
            .iter()
            .map(|x| (x.user(), x.item(), x.weight()))
            .collect();

        assert_eq!(
            pairs,
            vec![
                ("a", "b", 1.0),
                ("b", "a", 1.0),
                ("a", "c", 1.0),
                ("c", "a", 1.0)
            ]
        );
    }

    #[test]
    fn ratings_reflect_volume_share() {
        let interactions = transfer_ratings(vec![
            transfer("a", "b", 5.0),
            transfer("c", "a", 35.0),
            transfer("a", "d", 55.0),
            transfer("b", "a", 5.0),
        ]);

        let ratings: Vec<_> = interactions
            .iter()
            .map(|x| (x.user(), x.item(), x.weight()))
            .collect();

        // a moves 100 in total, every other account moves only with a.
        assert_eq!(
            ratings,
            vec![
                ("a", "b", 2.0),
                ("b", "a", 5.0),
                ("c", "a", 5.0),
                ("a", "c", 4.0),
                ("a", "d", 5.0),
                ("d", "a", 5.0)
            ]
        );
    }

    #[test]
    fn ratings_stay_in_range() {
        let interactions = transfer_ratings(vec![
            transfer("a", "b", 1.0),
            transfer("a", "c", 1000.0),
            transfer("a", "d", 0.5),
        ]);

        assert!(interactions
            .iter()
            .all(|x| x.weight() >= 1.0 && x.weight() <= 5.0));
    }

    #[test]
    fn buckets_floor_timestamps() {
        let interactions = activity_buckets(
            vec![
                Activity {
                    account: "a".to_owned(),
                    timestamp: 14_399,
                },
                Activity {
                    account: "a".to_owned(),
                    timestamp: 14_400,
                },
                Activity {
                    account: "b".to_owned(),
                    timestamp: -1,
                },
            ],
            DEFAULT_BUCKET_WIDTH,
            5.0,
        );

        let items: Vec<_> = interactions.iter().map(|x| x.item()).collect();

        assert_eq!(items, vec!["bucket:0", "bucket:14400", "bucket:-14400"]);
        assert!(interactions.iter().all(|x| x.weight() == 5.0));
        assert_eq!(interactions[2].timestamp(), Some(-1));
    }
}
