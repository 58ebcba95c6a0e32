use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::ExperimentError;

/// How threads and their chains are spread over NUMA domains.
///
/// Thread `i` always runs on domain `i mod domains` unless an explicit map is
/// given; the policy decides where each of its chains is allocated.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Placement {
    /// Chains live on the thread's own domain.
    #[default]
    Local,
    /// Chains live on `thread_domain ^ mask`.
    Xor(usize),
    /// Chains live on `thread_domain + offset`.
    Add(usize),
    /// Chain `j` lives on `thread_domain + j`.
    Interleave,
    /// Explicit `"t:c,c;t:c,c"` map, one group per thread.
    Map(String),
}

/// Thread-to-domain and (thread, chain)-to-domain maps.
pub(super) struct DomainMaps {
    pub thread_domain: Vec<usize>,
    pub chain_domain: Vec<Vec<usize>>,
}

impl Placement {
    pub fn name(&self) -> &'static str {
        match self {
            Placement::Local => "local",
            Placement::Xor(_) => "xor",
            Placement::Add(_) => "add",
            Placement::Interleave => "interleave",
            Placement::Map(_) => "map",
        }
    }

    /// The mask or offset argument, 0 for policies without one.
    pub fn offset_or_mask(&self) -> usize {
        match self {
            Placement::Xor(v) | Placement::Add(v) => *v,
            _ => 0,
        }
    }

    pub(super) fn domain_maps(
        &self,
        threads: usize,
        chains: usize,
        domains: usize,
    ) -> Result<DomainMaps, ExperimentError> {
        if let Placement::Map(map) = self {
            return parse_map(map, threads, chains, domains);
        }
        let thread_domain: Vec<usize> = (0..threads).map(|t| t % domains).collect();
        let chain_domain = thread_domain
            .iter()
            .map(|&node| {
                (0..chains)
                    .map(|c| match self {
                        Placement::Local | Placement::Map(_) => node,
                        Placement::Xor(mask) => (node ^ mask) % domains,
                        Placement::Add(offset) => (node + offset) % domains,
                        Placement::Interleave => (node + c) % domains,
                    })
                    .collect()
            })
            .collect();
        Ok(DomainMaps {
            thread_domain,
            chain_domain,
        })
    }
}

fn parse_map(
    map: &str,
    threads: usize,
    chains: usize,
    domains: usize,
) -> Result<DomainMaps, ExperimentError> {
    let bad = |why: String| ExperimentError::DomainMap(map.to_string(), why);
    let node = |s: &str| -> Result<usize, ExperimentError> {
        let node = s
            .trim()
            .parse::<usize>()
            .map_err(|e| bad(format!("{:?}: {}", s, e)))?;
        if node >= domains {
            return Err(ExperimentError::UnknownNode { node, domains });
        }
        Ok(node)
    };

    let groups: Vec<&str> = map.split(';').collect();
    if groups.len() != threads {
        return Err(bad(format!(
            "{} thread groups for {} threads",
            groups.len(),
            threads
        )));
    }
    let mut thread_domain = Vec::with_capacity(threads);
    let mut chain_domain = Vec::with_capacity(threads);
    for group in groups {
        let (thread, chain_list) = group
            .split_once(':')
            .ok_or_else(|| bad(format!("group {:?} lacks ':'", group)))?;
        let nodes = chain_list
            .split(',')
            .map(&node)
            .collect::<Result<Vec<_>, _>>()?;
        if nodes.len() != chains {
            return Err(bad(format!(
                "group {:?} places {} chains, expected {}",
                group,
                nodes.len(),
                chains
            )));
        }
        thread_domain.push(node(thread)?);
        chain_domain.push(nodes);
    }
    Ok(DomainMaps {
        thread_domain,
        chain_domain,
    })
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Xor(mask) => write!(f, "xor:{}", mask),
            Placement::Add(offset) => write!(f, "add:{}", offset),
            Placement::Map(map) => write!(f, "map:{}", map),
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for Placement {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, arg) = match s.split_once(':') {
            Some((kind, arg)) => (kind, Some(arg)),
            None => (s, None),
        };
        let number = |arg: Option<&str>| -> Result<usize, ExperimentError> {
            let arg = arg.ok_or_else(|| ExperimentError::Placement(s.to_string()))?;
            arg.parse()
                .map_err(|_| ExperimentError::Placement(s.to_string()))
        };
        match kind {
            "local" => Ok(Placement::Local),
            "interleave" => Ok(Placement::Interleave),
            "xor" => Ok(Placement::Xor(number(arg)?)),
            "add" => Ok(Placement::Add(number(arg)?)),
            "map" => arg
                .map(|map| Placement::Map(map.to_string()))
                .ok_or_else(|| ExperimentError::Placement(s.to_string())),
            _ => Err(ExperimentError::Placement(s.to_string())),
        }
    }
}

impl TryFrom<String> for Placement {
    type Error = ExperimentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Placement> for String {
    fn from(value: Placement) -> Self {
        value.to_string()
    }
}
