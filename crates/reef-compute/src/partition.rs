//! Splitting a key list into per-home spans for cross-node fan-out.

use std::sync::Arc;

use reef_cluster::{ClusterView, Node};
use reef_types::Key;

/// Partition `keys` by their home node under `view`.
///
/// Order is preserved within each span, so a job's associative merge
/// sees per-node partials in key order. Keys with no home (an empty
/// view) are dropped — callers check for an empty cluster up front.
pub fn partition_by_home(keys: &[Key], view: &ClusterView) -> Vec<(Arc<Node>, Vec<Key>)> {
    let mut spans: Vec<(Arc<Node>, Vec<Key>)> = Vec::new();
    for key in keys {
        let Some(home) = view.home_of(key) else {
            continue;
        };
        match spans.iter_mut().find(|(node, _)| Arc::ptr_eq(node, home)) {
            Some((_, span)) => span.push(key.clone()),
            None => spans.push((home.clone(), vec![key.clone()])),
        }
    }
    spans
}

#[cfg(test)]
mod tests {
    use reef_cluster::{ClusterView, NodeRegistry};
    use reef_types::NodeAddr;

    use super::*;

    fn addr(last: u8) -> NodeAddr {
        NodeAddr::new(std::net::Ipv4Addr::new(10, 0, 0, last), 4820)
    }

    #[test]
    fn test_spans_cover_all_keys_exactly_once() {
        let registry = NodeRegistry::new();
        let members = vec![
            registry.intern(addr(1)),
            registry.intern(addr(2)),
            registry.intern(addr(3)),
        ];
        let view = ClusterView::new(1, members);

        let keys: Vec<Key> = (0..100u32).map(|i| Key::new(i.to_le_bytes().to_vec())).collect();
        let spans = partition_by_home(&keys, &view);

        let total: usize = spans.iter().map(|(_, span)| span.len()).sum();
        assert_eq!(total, keys.len());

        for (node, span) in &spans {
            for key in span {
                assert!(
                    Arc::ptr_eq(view.home_of(key).unwrap(), node),
                    "key {key} landed in the wrong span"
                );
            }
        }
    }

    #[test]
    fn test_order_preserved_within_span() {
        let registry = NodeRegistry::new();
        let view = ClusterView::new(1, vec![registry.intern(addr(1)), registry.intern(addr(2))]);

        let keys: Vec<Key> = (0..50u32).map(|i| Key::new(i.to_le_bytes().to_vec())).collect();
        let spans = partition_by_home(&keys, &view);

        for (_, span) in &spans {
            let mut last_pos = None;
            for key in span {
                let pos = keys.iter().position(|k| k == key).unwrap();
                if let Some(last) = last_pos {
                    assert!(pos > last, "span keys out of original order");
                }
                last_pos = Some(pos);
            }
        }
    }

    #[test]
    fn test_single_member_gets_one_span() {
        let registry = NodeRegistry::new();
        let view = ClusterView::new(1, vec![registry.intern(addr(1))]);
        let keys: Vec<Key> = (0..10u32).map(|i| Key::new(i.to_le_bytes().to_vec())).collect();
        let spans = partition_by_home(&keys, &view);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].1, keys);
    }

    #[test]
    fn test_empty_view_drops_everything() {
        let view = ClusterView::new(1, Vec::new());
        let keys = vec![Key::from("a"), Key::from("b")];
        assert!(partition_by_home(&keys, &view).is_empty());
    }
}
