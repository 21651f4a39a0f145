//! Rooted fan-in/fan-out overlay over broker ranks.
//!
//! The topology is immutable after construction save for `set_rank` and the
//! per-rank `Aux` slots.

mod scheme;

pub use scheme::{HostEntry, TopologyUri};

use crate::aux::Aux;
use crate::error::{CoreError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::fmt;

/// An integer broker identifier in `[0, size)`. Rank 0 is always the tree
/// root. Wrapped in a newtype so routing code can't accidentally treat a
/// rank as a count or vice versa.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rank(u32);

impl Rank {
    pub const ROOT: Rank = Rank(0);

    pub fn new(value: u32) -> Self {
        Rank(value)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    fn idx(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rank({})", self.0)
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Rank {
    fn from(value: u32) -> Self {
        Rank(value)
    }
}

/// A recursive view of a subtree, as produced by [`Topology::json_subtree_at`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubtreeNode {
    pub rank: Rank,
    /// Descendant count plus one (i.e. the size of this subtree).
    pub size: u32,
    pub children: Vec<SubtreeNode>,
}

struct RankSlot {
    parent: Option<Rank>,
    aux: Mutex<Aux>,
}

/// An immutable (after construction) rooted tree over `[0, size)` ranks.
pub struct Topology {
    size: u32,
    self_rank: RwLock<Option<Rank>>,
    nodes: Vec<RankSlot>,
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("size", &self.size)
            .field("self_rank", &*self.self_rank.read())
            .finish_non_exhaustive()
    }
}

impl Topology {
    /// Parses `uri` (`"kary:<k>"`, `"mincrit[:<k>]"`, `"binomial"`, `"custom"`)
    /// and dispatches to the matching construction plugin. `hosts` is
    /// required (and only consulted) for the `custom` scheme: the
    /// surrounding broker is expected to supply the hosts array out of
    /// band.
    pub fn create(uri: &str, size: u32, hosts: Option<&[HostEntry]>) -> Result<Topology> {
        if size == 0 {
            return Err(CoreError::invalid("topology size must be >= 1"));
        }
        let parsed = TopologyUri::parse(uri)?;
        let mut parent: Vec<Option<Rank>> = (0..size)
            .map(|r| if r == 0 { None } else { Some(Rank::ROOT) })
            .collect();

        match parsed {
            TopologyUri::Kary(k) => scheme::kary::build(&mut parent, size, k)?,
            TopologyUri::Mincrit(k) => scheme::mincrit::build(&mut parent, size, k)?,
            TopologyUri::Binomial => scheme::binomial::build(&mut parent, size)?,
            TopologyUri::Custom => {
                let hosts = hosts
                    .ok_or_else(|| CoreError::invalid("custom topology requires a hosts array"))?;
                scheme::custom::build(&mut parent, size, hosts)?;
            }
        }

        let nodes = parent
            .into_iter()
            .map(|parent| RankSlot {
                parent,
                aux: Mutex::new(Aux::new()),
            })
            .collect();

        Ok(Topology {
            size,
            self_rank: RwLock::new(None),
            nodes,
        })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn set_rank(&self, rank: Rank) -> Result<()> {
        if rank.idx() >= self.size as usize {
            return Err(CoreError::invalid(format!(
                "rank {rank} out of range for topology of size {}",
                self.size
            )));
        }
        *self.self_rank.write() = Some(rank);
        Ok(())
    }

    pub fn self_rank(&self) -> Option<Rank> {
        *self.self_rank.read()
    }

    fn parent_of(&self, rank: Rank) -> Option<Rank> {
        self.nodes.get(rank.idx()).and_then(|n| n.parent)
    }

    /// O(1). Returns `None` if `self_rank` is the root (or unset ⇒ treated
    /// as root-relative queries failing softly to `None`).
    pub fn get_parent(&self) -> Option<Rank> {
        self.self_rank().and_then(|r| self.parent_of(r))
    }

    /// O(size). Ranks whose parent is `at_rank` (defaults to `self_rank`).
    pub fn get_child_ranks(&self, at_rank: Option<Rank>) -> Vec<Rank> {
        let at = at_rank.or_else(|| self.self_rank()).unwrap_or(Rank::ROOT);
        (0..self.size)
            .map(Rank)
            .filter(|&r| self.parent_of(r) == Some(at))
            .collect()
    }

    fn level_of(&self, mut rank: Rank) -> u32 {
        let mut level = 0;
        while let Some(p) = self.parent_of(rank) {
            level += 1;
            rank = p;
        }
        level
    }

    /// O(level). Level of `self_rank`; 0 for the root.
    pub fn get_level(&self) -> u32 {
        self.self_rank().map(|r| self.level_of(r)).unwrap_or(0)
    }

    /// O(size * level). Height of the whole tree.
    pub fn get_maxlevel(&self) -> u32 {
        (0..self.size).map(|r| self.level_of(Rank(r))).max().unwrap_or(0)
    }

    /// O(size * level). Number of ranks that descend from `at_rank`.
    pub fn get_descendant_count(&self, at_rank: Option<Rank>) -> u32 {
        let at = at_rank.or_else(|| self.self_rank()).unwrap_or(Rank::ROOT);
        (0..self.size)
            .map(Rank)
            .filter(|&r| r != at && self.is_descendant_of(r, at))
            .count() as u32
    }

    /// Whether `candidate` descends from `ancestor` by walking up the parent
    /// chain. Used both for descendant counting and for custom-topology cycle
    /// rejection.
    fn is_descendant_of(&self, mut candidate: Rank, ancestor: Rank) -> bool {
        while let Some(p) = self.parent_of(candidate) {
            if p == ancestor {
                return true;
            }
            candidate = p;
        }
        false
    }

    /// The immediate child of `self_rank` on the path to `dst`, or `None` if
    /// `dst` is not a (strict) descendant of `self_rank`.
    pub fn get_child_route(&self, dst: Rank) -> Option<Rank> {
        let me = self.self_rank()?;
        if dst == me {
            return None;
        }
        let mut cur = dst;
        while let Some(p) = self.parent_of(cur) {
            if p == me {
                return Some(cur);
            }
            cur = p;
        }
        None
    }

    /// Ranks that are the parent of at least one other rank.
    pub fn get_internal_ranks(&self) -> BTreeSet<Rank> {
        (0..self.size)
            .filter_map(|r| self.parent_of(Rank(r)))
            .collect()
    }

    pub fn json_subtree_at(&self, rank: Rank) -> SubtreeNode {
        let children = self
            .get_child_ranks(Some(rank))
            .into_iter()
            .map(|c| self.json_subtree_at(c))
            .collect();
        SubtreeNode {
            rank,
            size: self.get_descendant_count(Some(rank)) + 1,
            children,
        }
    }

    pub fn rank_aux_set<T: std::any::Any + Send + Sync>(
        &self,
        rank: Rank,
        value: T,
    ) -> Result<Option<T>> {
        let node = self
            .nodes
            .get(rank.idx())
            .ok_or_else(|| CoreError::invalid(format!("rank {rank} out of range")))?;
        Ok(node.aux.lock().insert(value))
    }

    pub fn rank_aux_get<T: std::any::Any + Send + Sync + Clone>(&self, rank: Rank) -> Option<T> {
        self.nodes.get(rank.idx())?.aux.lock().get::<T>().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;

    #[test]
    fn flat_kary_zero_parents_everyone_to_root() {
        let t = Topology::create("kary:0", 5, None).unwrap();
        for r in 1..5 {
            t.set_rank(Rank::new(r)).unwrap();
            assert_eq!(t.get_parent(), Some(Rank::ROOT));
        }
    }

    #[test]
    fn get_level_and_maxlevel_follow_the_kary_shape() {
        let t = Topology::create("kary:2", 7, None).unwrap();
        t.set_rank(Rank::new(0)).unwrap();
        assert_eq!(t.get_level(), 0);
        t.set_rank(Rank::new(1)).unwrap();
        assert_eq!(t.get_level(), 1);
        t.set_rank(Rank::new(3)).unwrap();
        assert_eq!(t.get_level(), 2);
        assert_eq!(t.get_maxlevel(), 2);
    }

    #[test]
    fn internal_ranks_are_exactly_the_parents() {
        let t = Topology::create("kary:2", 6, None).unwrap();
        let internal: Vec<u32> = t.get_internal_ranks().into_iter().map(Rank::get).collect();
        assert_eq!(internal, vec![0, 1, 2]);
    }

    #[test]
    fn json_subtree_reports_descendant_count_plus_one() {
        let t = Topology::create("kary:2", 6, None).unwrap();
        let tree = t.json_subtree_at(Rank::ROOT);
        assert_eq!(tree.rank, Rank::ROOT);
        assert_eq!(tree.size, 6);
        assert_eq!(tree.children.len(), 2);
    }

    #[test]
    fn rank_aux_round_trips_a_value() {
        let t = Topology::create("kary:2", 3, None).unwrap();
        assert_eq!(t.rank_aux_set(Rank::new(1), "hello".to_string()).unwrap(), None);
        assert_eq!(t.rank_aux_get::<String>(Rank::new(1)), Some("hello".to_string()));
        assert_eq!(t.rank_aux_get::<String>(Rank::new(2)), None);
    }

    #[test]
    fn rank_aux_out_of_range_is_invalid() {
        let t = Topology::create("kary:2", 3, None).unwrap();
        assert!(t.rank_aux_set(Rank::new(99), 1i32).is_err());
    }

    #[test]
    fn mincrit_explicit_k_routes_leaves_to_routers() {
        // size=7, k=2: rank 0 is root; ranks 1,2 are routers; ranks 3..7 are
        // leaves distributed round-robin over the 2 routers.
        let t = Topology::create("mincrit:2", 7, None).unwrap();
        t.set_rank(Rank::new(1)).unwrap();
        assert_eq!(t.get_parent(), Some(Rank::ROOT));
        t.set_rank(Rank::new(3)).unwrap();
        assert_eq!(t.get_parent(), Some(Rank::new(1)));
        t.set_rank(Rank::new(4)).unwrap();
        assert_eq!(t.get_parent(), Some(Rank::new(2)));
    }

    #[test]
    fn mincrit_k_one_is_rejected_when_auto_selected_but_allowed_explicitly() {
        // Small enough that auto-selection picks k=0 (flat), never k=1.
        let t = Topology::create("mincrit", 10, None).unwrap();
        t.set_rank(Rank::new(1)).unwrap();
        assert_eq!(t.get_parent(), Some(Rank::ROOT));

        // An explicit "mincrit:1" is accepted.
        let t = Topology::create("mincrit:1", 5, None).unwrap();
        t.set_rank(Rank::new(2)).unwrap();
        assert_eq!(t.get_parent(), Some(Rank::new(1)));
    }

    #[test]
    fn custom_topology_honors_supplied_parent_hosts() {
        let hosts = vec![
            HostEntry::root("node0"),
            HostEntry::child("node1", "node0"),
            HostEntry::child("node2", "node0"),
            HostEntry::child("node3", "node1"),
        ];
        let t = Topology::create("custom", 4, Some(&hosts)).unwrap();
        t.set_rank(Rank::new(3)).unwrap();
        assert_eq!(t.get_parent(), Some(Rank::new(1)));
        assert_eq!(t.get_descendant_count(Some(Rank::ROOT)), 3);
    }

    #[test]
    fn custom_topology_rejects_a_cycle() {
        let hosts = vec![
            HostEntry::root("node0"),
            HostEntry::child("node1", "node2"),
            HostEntry::child("node2", "node1"),
        ];
        let err = Topology::create("custom", 3, Some(&hosts)).unwrap_err();
        assert_eq!(err.status(), Status::Invalid);
    }

    #[test]
    fn custom_topology_rejects_root_with_a_parent() {
        let hosts = vec![HostEntry::child("node0", "node1"), HostEntry::root("node1")];
        let err = Topology::create("custom", 2, Some(&hosts)).unwrap_err();
        assert_eq!(err.status(), Status::Invalid);
    }

    #[test]
    fn unknown_scheme_is_invalid() {
        let err = Topology::create("nonsense", 4, None).unwrap_err();
        assert_eq!(err.status(), Status::Invalid);
    }
}
