//! Key-tile skip policy and the zero-fill of unreachable key tiles.

use evoattn_tiles::{element::Element, global::GlobalViewMut, plane};

/// Decides the first query row a key tile attends to.
///
/// A policy that returns `num_queries` or more for a key tile marks it as
/// unreachable: it gets no contributions, and its gradK/gradV rows are
/// zero-filled.
pub trait QueryStartPolicy: Send + Sync {
    fn query_start(&self, key_start: usize, num_queries: usize) -> usize;
}

/// Every key tile attends to every query.
#[derive(Clone, Copy, Debug, Default)]
pub struct FullAttention;

impl QueryStartPolicy for FullAttention {
    fn query_start(&self, _key_start: usize, _num_queries: usize) -> usize {
        0
    }
}

/// Tile-aligned start of the query loop for the key tile at `key_start`,
/// or `num_queries` when the key tile is unreachable.
pub fn first_query_tile<Q: QueryStartPolicy>(
    policy: &Q,
    key_start: usize,
    num_queries: usize,
    block_i: usize,
) -> usize {
    let start = policy.query_start(key_start, num_queries);
    if start >= num_queries {
        return num_queries;
    }
    start / block_i * block_i
}

/// Tile that follows `(query_start, key_start)` in the unit's walk: the next
/// query tile, or the first query tile of the next key tile.
pub fn next_iteration<Q: QueryStartPolicy>(
    policy: &Q,
    num_queries: usize,
    block_i: usize,
    block_j: usize,
    query_start: usize,
    key_start: usize,
) -> (usize, usize) {
    let next_query = query_start + block_i;
    if next_query < num_queries {
        return (next_query, key_start);
    }
    let next_key = key_start + block_j;
    (
        first_query_tile(policy, next_key, num_queries, block_i),
        next_key,
    )
}

/// Writes zeros to `rows` rows of gradK and gradV.
pub fn zero_fill_key_tile<E: Element>(
    grad_k: &mut GlobalViewMut<'_, E>,
    grad_v: &mut GlobalViewMut<'_, E>,
    rows: usize,
    head_dim: usize,
    head_dim_value: usize,
) {
    plane::fill_rows(grad_k, rows, head_dim, E::default());
    plane::fill_rows(grad_v, rows, head_dim_value, E::default());
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StartAt(usize);

    impl QueryStartPolicy for StartAt {
        fn query_start(&self, key_start: usize, _num_queries: usize) -> usize {
            if key_start == 0 { 0 } else { self.0 }
        }
    }

    #[test]
    fn walk_visits_every_query_tile_per_key_tile() {
        let mut visits = Vec::new();
        let (mut q, mut k) = (0, 0);
        while k < 20 {
            visits.push((q, k));
            (q, k) = next_iteration(&FullAttention, 10, 4, 8, q, k);
        }
        assert_eq!(
            visits,
            [(0, 0), (4, 0), (8, 0), (0, 8), (4, 8), (8, 8), (0, 16), (4, 16), (8, 16)]
        );
    }

    #[test]
    fn start_is_rounded_to_tile() {
        assert_eq!(first_query_tile(&StartAt(7), 8, 20, 4), 4);
        assert_eq!(next_iteration(&StartAt(7), 10, 4, 8, 8, 0), (4, 8));
    }

    #[test]
    fn unreachable_start_is_not_rounded_into_range() {
        assert_eq!(first_query_tile(&StartAt(10), 8, 10, 4), 10);
        assert_eq!(next_iteration(&StartAt(25), 10, 4, 8, 8, 0), (10, 8));
    }
}
