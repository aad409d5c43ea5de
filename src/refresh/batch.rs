//! Primary-key range partitioning of the token table.

/// Inclusive id range `[start_id, end_id]` processed as one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRange {
    pub index: u64,
    pub start_id: i64,
    pub end_id: i64,
}

/// Split ids `1..=max_token_id` into `ceil(max_token_id / batch_count)` ranges
/// of `batch_count` ids each. The last range may extend past `max_token_id`.
pub fn partition(max_token_id: i64, batch_count: i64) -> Vec<BatchRange> {
    if max_token_id <= 0 || batch_count <= 0 {
        return Vec::new();
    }

    let total = (max_token_id + batch_count - 1) / batch_count;
    (0..total)
        .map(|i| BatchRange {
            index: i as u64,
            start_id: 1 + i * batch_count,
            end_id: (i + 1) * batch_count,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_covers_every_id() {
        let batches = partition(2500, 1000);
        assert_eq!(
            batches,
            vec![
                BatchRange {
                    index: 0,
                    start_id: 1,
                    end_id: 1000
                },
                BatchRange {
                    index: 1,
                    start_id: 1001,
                    end_id: 2000
                },
                BatchRange {
                    index: 2,
                    start_id: 2001,
                    end_id: 3000
                },
            ]
        );
    }

    #[test]
    fn test_partition_edges() {
        assert!(partition(0, 1000).is_empty());
        assert!(partition(10, 0).is_empty());
        assert_eq!(partition(1000, 1000).len(), 1);
        assert_eq!(partition(1001, 1000).len(), 2);
        assert_eq!(partition(1, 1000)[0].end_id, 1000);
    }
}
