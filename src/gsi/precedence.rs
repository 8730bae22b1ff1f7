//! Race-breaking order between clusters

use crate::directory::types::{ClusterId, GrainId};

/// Whether `a` wins a race over `b` for `grain`.
///
/// Each cluster's rank is `uniform_hash(grain) ^ stable_hash(cluster)`; the
/// lower rank wins and equal ranks fall back to ordinal name order. Every
/// cluster computes the same answer without communicating.
pub fn precedes(grain: &GrainId, a: &ClusterId, b: &ClusterId) -> bool {
    let grain_hash = grain.uniform_hash();
    let rank_a = grain_hash ^ a.stable_hash();
    let rank_b = grain_hash ^ b.stable_hash();
    rank_a < rank_b || (rank_a == rank_b && a.as_str() < b.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_side_precedes() {
        let clusters: Vec<ClusterId> = ["A", "B", "C", "us-east", "eu-west", "ap-south"]
            .iter()
            .map(|n| ClusterId::new(*n))
            .collect();

        for key in 0..100 {
            let grain = GrainId::new("Player", key.to_string());
            for a in &clusters {
                for b in &clusters {
                    if a == b {
                        assert!(!precedes(&grain, a, b));
                    } else {
                        assert_ne!(precedes(&grain, a, b), precedes(&grain, b, a));
                    }
                }
            }
        }
    }

    #[test]
    fn test_rank_is_xxh3_of_grain_and_cluster_names() {
        use xxhash_rust::xxh3::xxh3_64;

        let grain = GrainId::new("Player", "11");
        let (a, b) = (ClusterId::new("us-east"), ClusterId::new("eu-west"));
        let rank_a = xxh3_64(b"Player/11") ^ xxh3_64(b"us-east");
        let rank_b = xxh3_64(b"Player/11") ^ xxh3_64(b"eu-west");
        assert_eq!(precedes(&grain, &a, &b), rank_a < rank_b);
        assert_eq!(precedes(&grain, &b, &a), rank_b < rank_a);
    }

    #[test]
    fn test_winner_varies_by_grain() {
        let a = ClusterId::new("A");
        let b = ClusterId::new("B");
        let wins = (0..200)
            .filter(|key| precedes(&GrainId::new("Player", key.to_string()), &a, &b))
            .count();
        assert!(wins > 0 && wins < 200);
    }

    #[test]
    fn test_is_transitive() {
        let grain = GrainId::new("Player", "7");
        let mut clusters: Vec<ClusterId> = (0..10).map(|i| ClusterId::new(format!("c{}", i))).collect();
        clusters.sort_by(|x, y| {
            if precedes(&grain, x, y) {
                std::cmp::Ordering::Less
            } else if precedes(&grain, y, x) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        });
        for pair in clusters.windows(2) {
            assert!(precedes(&grain, &pair[0], &pair[1]));
        }
        assert!(precedes(&grain, &clusters[0], &clusters[9]));
    }
}
