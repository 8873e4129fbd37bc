// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Downstream membership aggregation.
//!
//! Folds the per-group memberships of every downstream querier, plus any
//! administrative source filters, into the single membership the proxy
//! subscribes upstream. All rules are expressed over [`GroupMem`] values:
//! an INCLUDE of wanted sources or an EXCLUDE of refused sources.

use std::collections::BTreeMap;
use std::net::IpAddr;

use super::membership_db::FilterMode;
use super::source_list::SourceList;

/// One group membership as seen by the aggregation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMem {
    pub mode: FilterMode,
    pub sources: SourceList,
}

impl GroupMem {
    pub fn include(sources: SourceList) -> Self {
        Self {
            mode: FilterMode::Include,
            sources,
        }
    }

    pub fn exclude(sources: SourceList) -> Self {
        Self {
            mode: FilterMode::Exclude,
            sources,
        }
    }
}

impl std::fmt::Display for GroupMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.mode, self.sources)
    }
}

/// Administrative per-group source filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// Pass only the listed sources
    Whitelist,
    /// Pass everything except the listed sources
    Blacklist,
}

/// A source filter applied on top of aggregated memberships.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFilter {
    pub kind: FilterKind,
    pub sources: SourceList,
}

impl SourceFilter {
    pub fn whitelist(sources: SourceList) -> Self {
        Self {
            kind: FilterKind::Whitelist,
            sources,
        }
    }

    pub fn blacklist(sources: SourceList) -> Self {
        Self {
            kind: FilterKind::Blacklist,
            sources,
        }
    }
}

/// Normalize wildcard filters: a whitelist naming the wildcard source passes
/// everything (blacklist of nothing); a blacklist naming it passes nothing
/// (whitelist of nothing).
pub fn convert_wildcard_filter(filter: &mut SourceFilter) {
    if !filter.sources.contains_wildcard() {
        return;
    }
    filter.kind = match filter.kind {
        FilterKind::Whitelist => FilterKind::Blacklist,
        FilterKind::Blacklist => FilterKind::Whitelist,
    };
    filter.sources.clear();
}

/// Merge `from` into `to`: the result accepts every source either membership
/// accepts.
pub fn merge_memberships(to: &mut GroupMem, from: &GroupMem) {
    use FilterMode::*;
    match (to.mode, from.mode) {
        // IN(A) + IN(B) = IN(A + B)
        (Include, Include) => to.sources += &from.sources,
        // IN(A) + EX(B) = EX(B - A)
        (Include, Exclude) => {
            to.sources = &from.sources - &to.sources;
            to.mode = Exclude;
        }
        // EX(A) + IN(B) = EX(A - B)
        (Exclude, Include) => to.sources -= &from.sources,
        // EX(A) + EX(B) = EX(A * B)
        (Exclude, Exclude) => to.sources *= &from.sources,
    }
}

/// Restrict `to` by a source filter. Wildcard filters are normalized first.
pub fn merge_membership_filter(to: &mut GroupMem, filter: &SourceFilter) {
    let mut filter = filter.clone();
    convert_wildcard_filter(&mut filter);

    use FilterKind::*;
    use FilterMode::*;
    match (to.mode, filter.kind) {
        // IN(A) through WL(B) = IN(A * B)
        (Include, Whitelist) => to.sources *= &filter.sources,
        // IN(A) through BL(B) = IN(A - B)
        (Include, Blacklist) => to.sources -= &filter.sources,
        // EX(A) through WL(B) = IN(B - A)
        (Exclude, Whitelist) => {
            to.sources = &filter.sources - &to.sources;
            to.mode = Include;
        }
        // EX(A) through BL(B) = EX(A + B)
        (Exclude, Blacklist) => to.sources += &filter.sources,
    }
}

/// The complement of [`merge_membership_filter`]: what of the original
/// membership the filter held back.
pub fn merge_membership_filter_reminder(original: &GroupMem, filter: &SourceFilter) -> GroupMem {
    let mut filter = filter.clone();
    convert_wildcard_filter(&mut filter);

    use FilterKind::*;
    use FilterMode::*;
    match (original.mode, filter.kind) {
        // IN(A) held back by WL(B): IN(A - B)
        (Include, Whitelist) => GroupMem::include(&original.sources - &filter.sources),
        // IN(A) held back by BL(B): IN(A * B)
        (Include, Blacklist) => GroupMem::include(&original.sources * &filter.sources),
        // EX(A) held back by WL(B): EX(A + B)
        (Exclude, Whitelist) => GroupMem::exclude(&original.sources + &filter.sources),
        // EX(A) held back by BL(B): IN(B - A)
        (Exclude, Blacklist) => GroupMem::include(&filter.sources - &original.sources),
    }
}

/// Remove the contribution of `from` from `to`.
pub fn disjoin_memberships(to: &mut GroupMem, from: &GroupMem) {
    use FilterMode::*;
    match (to.mode, from.mode) {
        // IN(A) without IN(B) = IN(A - B)
        (Include, Include) => to.sources -= &from.sources,
        // IN(A) without EX(B) = IN(A * B)
        (Include, Exclude) => to.sources *= &from.sources,
        // EX(A) without IN(B) = EX(A + B)
        (Exclude, Include) => to.sources += &from.sources,
        // EX(A) without EX(B) = IN(A - B)
        (Exclude, Exclude) => {
            to.sources = &to.sources - &from.sources;
            to.mode = Include;
        }
    }
}

/// Accumulates group memberships from every downstream interface into the
/// upstream subscription map.
#[derive(Debug, Default)]
pub struct MembershipAggregation {
    groups: BTreeMap<IpAddr, GroupMem>,
}

impl MembershipAggregation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one downstream membership into the aggregate.
    pub fn add_membership(&mut self, gaddr: IpAddr, mem: GroupMem) {
        match self.groups.get_mut(&gaddr) {
            Some(existing) => merge_memberships(existing, &mem),
            None => {
                self.groups.insert(gaddr, mem);
            }
        }
    }

    /// Apply an administrative filter to one group, if present.
    pub fn apply_filter(&mut self, gaddr: &IpAddr, filter: &SourceFilter) {
        if let Some(mem) = self.groups.get_mut(gaddr) {
            merge_membership_filter(mem, filter);
        }
    }

    pub fn groups(&self) -> &BTreeMap<IpAddr, GroupMem> {
        &self.groups
    }

    pub fn into_groups(self) -> BTreeMap<IpAddr, GroupMem> {
        self.groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(addrs: &[&str]) -> SourceList {
        addrs.iter().map(|a| a.parse().unwrap()).collect()
    }

    fn in_mem(addrs: &[&str]) -> GroupMem {
        GroupMem::include(list(addrs))
    }

    fn ex_mem(addrs: &[&str]) -> GroupMem {
        GroupMem::exclude(list(addrs))
    }

    #[test]
    fn test_convert_wildcard_filter() {
        let mut keep = SourceFilter::whitelist(list(&["1.1.1.1", "3.3.3.3"]));
        convert_wildcard_filter(&mut keep);
        assert_eq!(keep, SourceFilter::whitelist(list(&["1.1.1.1", "3.3.3.3"])));

        let mut wl_wc = SourceFilter::whitelist(list(&["0.0.0.0"]));
        convert_wildcard_filter(&mut wl_wc);
        assert_eq!(wl_wc, SourceFilter::blacklist(SourceList::new()));

        let mut bl_wc = SourceFilter::blacklist(list(&["0.0.0.0"]));
        convert_wildcard_filter(&mut bl_wc);
        assert_eq!(bl_wc, SourceFilter::whitelist(SourceList::new()));

        // A wildcard buried among concrete sources still dominates.
        let mut mixed = SourceFilter::whitelist(list(&["1.1.1.1", "0.0.0.0", "3.3.3.3"]));
        convert_wildcard_filter(&mut mixed);
        assert_eq!(mixed, SourceFilter::blacklist(SourceList::new()));
    }

    #[test]
    fn test_merge_memberships() {
        // IN{s1,s2} merge IN{s1,s3} = IN{s1,s2,s3}
        let mut to = in_mem(&["1.1.1.1", "2.2.2.2"]);
        merge_memberships(&mut to, &in_mem(&["1.1.1.1", "3.3.3.3"]));
        assert_eq!(to, in_mem(&["1.1.1.1", "2.2.2.2", "3.3.3.3"]));

        // IN{s1,s2} merge EX{s1,s3} = EX{s3}
        let mut to = in_mem(&["1.1.1.1", "2.2.2.2"]);
        merge_memberships(&mut to, &ex_mem(&["1.1.1.1", "3.3.3.3"]));
        assert_eq!(to, ex_mem(&["3.3.3.3"]));

        // EX{s1,s2} merge IN{s1,s3} = EX{s2}
        let mut to = ex_mem(&["1.1.1.1", "2.2.2.2"]);
        merge_memberships(&mut to, &in_mem(&["1.1.1.1", "3.3.3.3"]));
        assert_eq!(to, ex_mem(&["2.2.2.2"]));

        // EX{s1,s2} merge EX{s1,s3} = EX{s1}
        let mut to = ex_mem(&["1.1.1.1", "2.2.2.2"]);
        merge_memberships(&mut to, &ex_mem(&["1.1.1.1", "3.3.3.3"]));
        assert_eq!(to, ex_mem(&["1.1.1.1"]));
    }

    #[test]
    fn test_merge_membership_filter() {
        let wl = SourceFilter::whitelist(list(&["1.1.1.1", "3.3.3.3"]));
        let bl = SourceFilter::blacklist(list(&["1.1.1.1", "3.3.3.3"]));

        // IN{s1,s2} through WL{s1,s3} = IN{s1}
        let mut to = in_mem(&["1.1.1.1", "2.2.2.2"]);
        merge_membership_filter(&mut to, &wl);
        assert_eq!(to, in_mem(&["1.1.1.1"]));

        // IN{s1,s2} through BL{s1,s3} = IN{s2}
        let mut to = in_mem(&["1.1.1.1", "2.2.2.2"]);
        merge_membership_filter(&mut to, &bl);
        assert_eq!(to, in_mem(&["2.2.2.2"]));

        // EX{s1,s2} through WL{s1,s3} = IN{s3}
        let mut to = ex_mem(&["1.1.1.1", "2.2.2.2"]);
        merge_membership_filter(&mut to, &wl);
        assert_eq!(to, in_mem(&["3.3.3.3"]));

        // EX{s1,s2} through BL{s1,s3} = EX{s1,s2,s3}
        let mut to = ex_mem(&["1.1.1.1", "2.2.2.2"]);
        merge_membership_filter(&mut to, &bl);
        assert_eq!(to, ex_mem(&["1.1.1.1", "2.2.2.2", "3.3.3.3"]));
    }

    #[test]
    fn test_merge_membership_wildcard_filter() {
        let wl_wc = SourceFilter::whitelist(list(&["0.0.0.0"]));
        let bl_wc = SourceFilter::blacklist(list(&["0.0.0.0"]));

        // IN{s1,s2} through WL{*} = IN{s1,s2}
        let mut to = in_mem(&["1.1.1.1", "2.2.2.2"]);
        merge_membership_filter(&mut to, &wl_wc);
        assert_eq!(to, in_mem(&["1.1.1.1", "2.2.2.2"]));

        // IN{s1,s2} through BL{*} = IN{}
        let mut to = in_mem(&["1.1.1.1", "2.2.2.2"]);
        merge_membership_filter(&mut to, &bl_wc);
        assert_eq!(to, in_mem(&[]));

        // EX{s1,s2} through WL{*} = EX{s1,s2}
        let mut to = ex_mem(&["1.1.1.1", "2.2.2.2"]);
        merge_membership_filter(&mut to, &wl_wc);
        assert_eq!(to, ex_mem(&["1.1.1.1", "2.2.2.2"]));

        // EX{s1,s2} through BL{*} = IN{}
        let mut to = ex_mem(&["1.1.1.1", "2.2.2.2"]);
        merge_membership_filter(&mut to, &bl_wc);
        assert_eq!(to, in_mem(&[]));
    }

    #[test]
    fn test_merge_membership_filter_reminder() {
        let wl = SourceFilter::whitelist(list(&["1.1.1.1", "3.3.3.3"]));
        let bl = SourceFilter::blacklist(list(&["1.1.1.1", "3.3.3.3"]));

        // IN{s1,s2} held back by WL{s1,s3}: IN{s2}
        assert_eq!(
            merge_membership_filter_reminder(&in_mem(&["1.1.1.1", "2.2.2.2"]), &wl),
            in_mem(&["2.2.2.2"])
        );
        // IN{s1,s2} held back by BL{s1,s3}: IN{s1}
        assert_eq!(
            merge_membership_filter_reminder(&in_mem(&["1.1.1.1", "2.2.2.2"]), &bl),
            in_mem(&["1.1.1.1"])
        );
        // EX{s1,s2} held back by WL{s1,s3}: EX{s1,s2,s3}
        assert_eq!(
            merge_membership_filter_reminder(&ex_mem(&["1.1.1.1", "2.2.2.2"]), &wl),
            ex_mem(&["1.1.1.1", "2.2.2.2", "3.3.3.3"])
        );
        // EX{s1,s2} held back by BL{s1,s3}: IN{s3}
        assert_eq!(
            merge_membership_filter_reminder(&ex_mem(&["1.1.1.1", "2.2.2.2"]), &bl),
            in_mem(&["3.3.3.3"])
        );
    }

    #[test]
    fn test_merge_membership_wildcard_filter_reminder() {
        let wl_wc = SourceFilter::whitelist(list(&["0.0.0.0"]));
        let bl_wc = SourceFilter::blacklist(list(&["0.0.0.0"]));

        // IN{s1,s2} with WL{*} holds nothing back
        assert_eq!(
            merge_membership_filter_reminder(&in_mem(&["1.1.1.1", "2.2.2.2"]), &wl_wc),
            in_mem(&[])
        );
        // IN{s1,s2} with BL{*} holds everything back
        assert_eq!(
            merge_membership_filter_reminder(&in_mem(&["1.1.1.1", "2.2.2.2"]), &bl_wc),
            in_mem(&["1.1.1.1", "2.2.2.2"])
        );
        // EX{s1,s2} with WL{*} holds nothing back
        assert_eq!(
            merge_membership_filter_reminder(&ex_mem(&["1.1.1.1", "2.2.2.2"]), &wl_wc),
            in_mem(&[])
        );
        // EX{s1,s2} with BL{*} holds everything back
        assert_eq!(
            merge_membership_filter_reminder(&ex_mem(&["1.1.1.1", "2.2.2.2"]), &bl_wc),
            ex_mem(&["1.1.1.1", "2.2.2.2"])
        );
    }

    #[test]
    fn test_disjoin_memberships() {
        // IN{s1,s2} disjoin IN{s1,s3} = IN{s2}
        let mut to = in_mem(&["1.1.1.1", "2.2.2.2"]);
        disjoin_memberships(&mut to, &in_mem(&["1.1.1.1", "3.3.3.3"]));
        assert_eq!(to, in_mem(&["2.2.2.2"]));

        // IN{s1,s2} disjoin EX{s1,s3} = IN{s1}
        let mut to = in_mem(&["1.1.1.1", "2.2.2.2"]);
        disjoin_memberships(&mut to, &ex_mem(&["1.1.1.1", "3.3.3.3"]));
        assert_eq!(to, in_mem(&["1.1.1.1"]));

        // EX{s1,s2} disjoin IN{s1,s3} = EX{s1,s2,s3}
        let mut to = ex_mem(&["1.1.1.1", "2.2.2.2"]);
        disjoin_memberships(&mut to, &in_mem(&["1.1.1.1", "3.3.3.3"]));
        assert_eq!(to, ex_mem(&["1.1.1.1", "2.2.2.2", "3.3.3.3"]));

        // EX{s1,s2} disjoin EX{s1,s3} = IN{s2}
        let mut to = ex_mem(&["1.1.1.1", "2.2.2.2"]);
        disjoin_memberships(&mut to, &ex_mem(&["1.1.1.1", "3.3.3.3"]));
        assert_eq!(to, in_mem(&["2.2.2.2"]));
    }

    #[test]
    fn test_aggregation_folds_and_filters() {
        let g1: IpAddr = "239.1.1.1".parse().unwrap();
        let g2: IpAddr = "239.2.2.2".parse().unwrap();

        let mut agg = MembershipAggregation::new();
        agg.add_membership(g1, in_mem(&["1.1.1.1", "2.2.2.2"]));
        agg.add_membership(g1, in_mem(&["1.1.1.1", "3.3.3.3"]));
        agg.add_membership(g2, ex_mem(&["1.1.1.1"]));

        assert_eq!(
            agg.groups().get(&g1),
            Some(&in_mem(&["1.1.1.1", "2.2.2.2", "3.3.3.3"]))
        );
        assert_eq!(agg.groups().get(&g2), Some(&ex_mem(&["1.1.1.1"])));

        agg.apply_filter(&g1, &SourceFilter::blacklist(list(&["1.1.1.1"])));
        assert_eq!(
            agg.groups().get(&g1),
            Some(&in_mem(&["2.2.2.2", "3.3.3.3"]))
        );
    }
}
