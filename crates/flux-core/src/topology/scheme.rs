//! Construction plugins: `kary`, `mincrit`, `binomial`, `custom`.
//!
//! Each receives the `parent` array already defaulted to "everyone's parent
//! is rank 0" and overwrites the entries its scheme governs.

use super::Rank;
use crate::error::{CoreError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopologyUri {
    Kary(u32),
    Mincrit(Option<u32>),
    Binomial,
    Custom,
}

impl TopologyUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, arg) = match uri.split_once(':') {
            Some((s, a)) => (s, Some(a)),
            None => (uri, None),
        };
        match scheme {
            "kary" => {
                let k = parse_u32(arg.ok_or_else(|| CoreError::invalid("kary requires an integer argument"))?)?;
                Ok(TopologyUri::Kary(k))
            }
            "mincrit" => Ok(TopologyUri::Mincrit(arg.map(parse_u32).transpose()?)),
            "binomial" => {
                if arg.is_some() {
                    return Err(CoreError::invalid("binomial takes no argument"));
                }
                Ok(TopologyUri::Binomial)
            }
            "custom" => {
                if arg.is_some() {
                    return Err(CoreError::invalid("custom takes no argument"));
                }
                Ok(TopologyUri::Custom)
            }
            other => Err(CoreError::invalid(format!("unknown topology scheme '{other}'"))),
        }
    }
}

fn parse_u32(s: &str) -> Result<u32> {
    s.parse::<u32>()
        .map_err(|_| CoreError::invalid(format!("'{s}' is not a non-negative integer")))
}

/// `⌊(i−1)/K⌋` k-ary numbering; `K=0` is the flat tree (already the default).
pub mod kary {
    use super::*;

    pub fn build(parent: &mut [Option<Rank>], size: u32, k: u32) -> Result<()> {
        if k == 0 {
            return Ok(()); // flat: defaults already have everyone parented to 0.
        }
        for i in 1..size {
            parent[i as usize] = Some(Rank::new((i - 1) / k));
        }
        Ok(())
    }
}

/// At most three levels: rank 0 fans out to `K` routers, each router fans out
/// to a slice of the remaining leaves.
pub mod mincrit {
    use super::*;

    const DEFAULT_MAX_FANOUT: u32 = 1024;

    /// Fanout from the router layer to leaves, for a candidate `k`.
    fn router_fanout(size: u32, k: u32) -> u32 {
        let crit = 1 + k;
        let leaves = size.saturating_sub(crit);
        leaves.div_ceil(k)
    }

    /// Smallest `k` that keeps router→leaf fanout at or below `max_fanout`,
    /// never auto-selecting `k=1`: a single router just pushes some router
    /// work off to rank 1 without any tree benefit, so it is only used when
    /// the caller asks for it explicitly.
    fn choose_k(size: u32, max_fanout: u32) -> u32 {
        if size <= max_fanout + 1 {
            return 0;
        }
        let mut k = 2;
        while router_fanout(size, k) > max_fanout {
            k += 1;
        }
        k
    }

    pub fn build(parent: &mut [Option<Rank>], size: u32, k: Option<u32>) -> Result<()> {
        let k = match k {
            Some(k) => k, // explicit k=1 is permitted here.
            None => choose_k(size, DEFAULT_MAX_FANOUT),
        };
        if k == 0 {
            return Ok(());
        }
        if k >= size {
            return Err(CoreError::invalid(format!(
                "mincrit k={k} leaves no room for leaves under a tree of size {size}"
            )));
        }
        for i in (k + 1)..size {
            parent[i as usize] = Some(Rank::new((i - k - 1) % k + 1));
        }
        Ok(())
    }
}

/// Recursive binomial tree: `child = root + 2^j` for `j` in `0..k`.
pub mod binomial {
    use super::*;

    fn smallest_k(size: u32) -> u32 {
        let mut k = 0u32;
        while (1u64 << k) < size as u64 {
            k += 1;
        }
        k
    }

    fn generate(parent: &mut [Option<Rank>], size: u32, root: u32, k: u32) {
        for j in 0..k {
            let child = root + (1 << j);
            if child < size {
                parent[child as usize] = Some(Rank::new(root));
                generate(parent, size, child, j);
            }
        }
    }

    pub fn build(parent: &mut [Option<Rank>], size: u32) -> Result<()> {
        let k = smallest_k(size);
        generate(parent, size, 0, k);
        Ok(())
    }
}

/// An externally supplied `{host, parent}` entry, rank-indexed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostEntry {
    pub host: String,
    pub parent: Option<String>,
}

impl HostEntry {
    pub fn root(host: impl Into<String>) -> Self {
        HostEntry { host: host.into(), parent: None }
    }

    pub fn child(host: impl Into<String>, parent: impl Into<String>) -> Self {
        HostEntry { host: host.into(), parent: Some(parent.into()) }
    }
}

pub mod custom {
    use super::*;

    fn find_host_rank(hosts: &[HostEntry], name: &str) -> Option<u32> {
        hosts.iter().position(|h| h.host == name).map(|i| i as u32)
    }

    fn is_descendant_of(parent: &[Option<Rank>], candidate: u32, ancestor: u32) -> bool {
        let mut cur = candidate;
        while let Some(p) = parent[cur as usize] {
            if p.get() == ancestor {
                return true;
            }
            cur = p.get();
        }
        false
    }

    pub fn build(parent: &mut [Option<Rank>], size: u32, hosts: &[HostEntry]) -> Result<()> {
        if hosts.len() as u32 != size {
            return Err(CoreError::invalid("topology size does not match host array size"));
        }
        for (rank, entry) in hosts.iter().enumerate() {
            let rank = rank as u32;
            match (&entry.parent, rank) {
                (Some(_), 0) => {
                    return Err(CoreError::invalid(format!(
                        "rank 0 ({}) may not have a parent in a tree topology",
                        entry.host
                    )));
                }
                (None, 0) => continue, // root keeps parent = None.
                (None, _) => {
                    return Err(CoreError::invalid(format!(
                        "{} (rank {rank}) has no parent",
                        entry.host
                    )));
                }
                (Some(parent_host), _) => {
                    let parent_rank = find_host_rank(hosts, parent_host).ok_or_else(|| {
                        CoreError::invalid(format!(
                            "invalid parent \"{parent_host}\" for {} (rank {rank})",
                            entry.host
                        ))
                    })?;
                    if parent_rank == rank || is_descendant_of(parent, parent_rank, rank) {
                        return Err(CoreError::invalid(format!(
                            "parent \"{parent_host}\" for {} (rank {rank}) violates rule against cycles",
                            entry.host
                        )));
                    }
                    parent[rank as usize] = Some(Rank::new(parent_rank));
                }
            }
        }
        Ok(())
    }
}
