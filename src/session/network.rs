//! Primary IP selection over an instance's networks.

use std::collections::BTreeMap;

use regex::Regex;

use super::ProvisionError;

/// Picks the first address of the single network whose name matches
/// `pattern`, or of the only network when no pattern is given. Networks
/// without addresses never match.
///
/// # Errors
///
/// Returns [`ProvisionError::NoIpFound`] when nothing matches and
/// [`ProvisionError::MultipleIp`] when more than one network does.
pub fn select_primary_ip(
    networks: &BTreeMap<String, Vec<String>>,
    pattern: Option<&Regex>,
) -> Result<String, ProvisionError> {
    let matches: Vec<(&String, &String)> = networks
        .iter()
        .filter(|(name, _)| pattern.is_none_or(|regex| regex.is_match(name)))
        .filter_map(|(name, addresses)| addresses.first().map(|address| (name, address)))
        .collect();

    match matches.as_slice() {
        [(_, address)] => Ok((*address).clone()),
        [] => Err(ProvisionError::NoIpFound {
            pattern: pattern.map(|regex| regex.as_str().to_owned()),
            networks: networks.keys().cloned().collect(),
        }),
        _ => Err(ProvisionError::MultipleIp {
            pattern: pattern.map(|regex| regex.as_str().to_owned()),
            matches: matches.iter().map(|(name, _)| (*name).clone()).collect(),
        }),
    }
}
