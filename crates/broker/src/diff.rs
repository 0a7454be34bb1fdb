//! C8: pure function computing add/modify/remove sets between the local
//! hardware inventory and the chain's last-known copy (§4.5.7, §4.7, P7).

use mlnet_chain_client::HardwareNode;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct HardwareDiff {
    pub new_or_modified: Vec<HardwareNode>,
    pub removed: Vec<HardwareNode>,
}

/// `diff(chain, local)`: nodes missing on chain or disagreeing (by id,
/// status, sorted hardware, or sorted models) go to `new_or_modified`;
/// chain records absent locally go to `removed`. Equality is the relation
/// of §4.7 — both sides are normalized (sorted) before comparing.
pub fn diff(chain: &[HardwareNode], local: &[HardwareNode]) -> HardwareDiff {
    let mut new_or_modified = Vec::new();
    for l in local {
        let l_norm = l.normalized();
        let matches_chain = chain.iter().any(|c| c.normalized() == l_norm);
        if !matches_chain {
            new_or_modified.push(l.clone());
        }
    }

    let mut removed = Vec::new();
    for c in chain {
        if !local.iter().any(|l| l.id == c.id) {
            removed.push(c.clone());
        }
    }

    HardwareDiff {
        new_or_modified,
        removed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlnet_primitives::HardwareNodeStatus;

    fn node(id: &str, counts: &[(&str, u32)], models: &[&str]) -> HardwareNode {
        HardwareNode {
            id: id.to_string(),
            status: HardwareNodeStatus::Inference,
            hardware: counts
                .iter()
                .map(|(t, c)| mlnet_primitives::HardwareSpec {
                    hw_type: t.to_string(),
                    count: *c,
                })
                .collect(),
            models: models.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn identical_sets_produce_empty_diff() {
        let chain = vec![node("n1", &[("GPU", 2)], &["model1"])];
        let local = vec![node("n1", &[("GPU", 2)], &["model1"])];
        assert_eq!(diff(&chain, &local), HardwareDiff::default());
    }

    #[test]
    fn modification_flags_new_or_modified() {
        let chain = vec![node("n1", &[("GPU", 2)], &["model1"])];
        let local = vec![node("n1", &[("GPU", 4)], &["model1"])];
        let d = diff(&chain, &local);
        assert_eq!(d.new_or_modified, vec![node("n1", &[("GPU", 4)], &["model1"])]);
        assert!(d.removed.is_empty());
    }

    #[test]
    fn missing_locally_is_removed() {
        let chain = vec![node("n1", &[("GPU", 2)], &["model1"])];
        let local = vec![];
        let d = diff(&chain, &local);
        assert!(d.new_or_modified.is_empty());
        assert_eq!(d.removed, vec![node("n1", &[("GPU", 2)], &["model1"])]);
    }

    #[test]
    fn hardware_order_does_not_matter() {
        let chain = vec![node("n1", &[("GPU", 2), ("CPU", 1)], &["model1"])];
        let local = vec![node("n1", &[("CPU", 1), ("GPU", 2)], &["model1"])];
        assert_eq!(diff(&chain, &local), HardwareDiff::default());
    }

    #[test]
    fn round_trip_applying_diff_matches_local() {
        // P7: applying diff(C,L) to C yields a map equal to L under §4.7.
        let chain = vec![node("n1", &[("GPU", 2)], &["model1"])];
        let local = vec![
            node("n1", &[("GPU", 4)], &["model1"]),
            node("n2", &[("GPU", 1)], &["model2"]),
        ];
        let d = diff(&chain, &local);
        let mut applied: Vec<HardwareNode> = chain
            .iter()
            .filter(|c| !d.removed.iter().any(|r| r.id == c.id))
            .cloned()
            .collect();
        for nm in &d.new_or_modified {
            applied.retain(|a| a.id != nm.id);
            applied.push(nm.clone());
        }
        let mut applied_norm: Vec<_> = applied.iter().map(|n| n.normalized()).collect();
        let mut local_norm: Vec<_> = local.iter().map(|n| n.normalized()).collect();
        applied_norm.sort_by(|a, b| a.id.cmp(&b.id));
        local_norm.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(applied_norm, local_norm);
    }
}
