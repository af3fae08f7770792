// Community and attribute decoding
//
// Decoders turn a route's community tags and local-preference into labels. Several
// decoders can be registered; their label maps are merged in registration order and
// the last decoder to produce a key wins.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

pub type Labels = BTreeMap<String, String>;

pub trait CommunityDecoder: Send + Sync {
    fn name(&self) -> &str;

    /// Must not fail: communities it does not understand are ignored.
    fn decode(&self, communities: &[String], local_pref: Option<u32>) -> Labels;
}

/// A syntactically valid community tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Community {
    /// `asn:value`
    Standard { asn: u32, value: u32 },
    /// `global:local1:local2`
    Large { global: u32, local1: u32, local2: u32 },
    /// `target:65000:100`, `origin:...`
    Extended { kind: String, value: String },
    WellKnown(String),
}

const WELL_KNOWN: &[&str] = &[
    "no-export",
    "no-advertise",
    "no-export-subconfed",
    "local-as",
    "blackhole",
    "graceful-shutdown",
    "llgr-stale",
    "no-llgr",
];

const EXTENDED_KINDS: &[&str] = &["target", "origin", "bandwidth", "color", "encapsulation"];

impl FromStr for Community {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if WELL_KNOWN.contains(&raw.to_lowercase().as_str()) {
            return Ok(Community::WellKnown(raw.to_lowercase()));
        }

        let parts: Vec<&str> = raw.split(':').collect();
        if let Some(kind) = parts.first() {
            if EXTENDED_KINDS.contains(kind) && parts.len() >= 3 {
                return Ok(Community::Extended {
                    kind: kind.to_string(),
                    value: parts[1..].join(":"),
                });
            }
        }

        let numbers: Option<Vec<u32>> = parts.iter().map(|p| p.parse().ok()).collect();
        match numbers.as_deref() {
            Some([asn, value]) => Ok(Community::Standard {
                asn: *asn,
                value: *value,
            }),
            Some([global, local1, local2]) => Ok(Community::Large {
                global: *global,
                local1: *local1,
                local2: *local2,
            }),
            _ => Err(format!("malformed community '{}'", raw)),
        }
    }
}

/// Labels from every registered decoder plus the tags none of them could parse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedAttributes {
    pub labels: Labels,
    pub malformed: Vec<String>,
}

#[derive(Clone, Default)]
pub struct DecoderRegistry {
    decoders: Vec<Arc<dyn CommunityDecoder>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        DecoderRegistry::default()
    }

    pub fn register(&mut self, decoder: Arc<dyn CommunityDecoder>) {
        tracing::debug!("Registered community decoder {}", decoder.name());
        self.decoders.push(decoder);
    }

    pub fn with(mut self, decoder: Arc<dyn CommunityDecoder>) -> Self {
        self.register(decoder);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.decoders.iter().map(|d| d.name()).collect()
    }

    pub fn decode(&self, communities: &[String], local_pref: Option<u32>) -> DecodedAttributes {
        let mut decoded = DecodedAttributes::default();
        for decoder in &self.decoders {
            decoded.labels.extend(decoder.decode(communities, local_pref));
        }
        decoded.malformed = communities
            .iter()
            .filter(|c| c.parse::<Community>().is_err())
            .cloned()
            .collect();
        decoded
    }
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderRegistry")
            .field("decoders", &self.names())
            .finish()
    }
}

/// Local-preference bucket: 200 and above is primary, 100-199 secondary, below 100
/// tertiary.
pub fn preference_tier(local_pref: u32) -> &'static str {
    match local_pref {
        200.. => "primary",
        100..=199 => "secondary",
        _ => "tertiary",
    }
}

/// Site-tagging convention: `X:<oid_marker>` names the site that created the prefix,
/// `X:<aid_marker>` the site currently advertising it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteCommunityDecoder {
    pub oid_marker: u32,
    pub aid_marker: u32,
    /// Site number to region
    pub site_regions: BTreeMap<u32, String>,
    /// Region to failover orders, one per deciding site; the chain's first site decides
    pub failover_chains: BTreeMap<String, Vec<Vec<u32>>>,
}

const DEFAULT_ROUTE_MARKER: u32 = 0;
const LP_PRIMARY: u32 = 200;
const LP_SECONDARY: u32 = 150;
const LP_TERTIARY: u32 = 50;
const CHILD_ORIGINATED: &[&str] = &["41326:41326", "3124:3124"];

impl Default for SiteCommunityDecoder {
    fn default() -> Self {
        let mut site_regions = BTreeMap::new();
        for site in [1, 2, 3, 4] {
            site_regions.insert(site, "americas".to_string());
        }
        for site in [7, 8] {
            site_regions.insert(site, "emea".to_string());
        }
        for site in [17, 18, 19] {
            site_regions.insert(site, "apac".to_string());
        }
        let failover_chains = BTreeMap::from([
            (
                "americas".to_string(),
                vec![vec![1, 2, 3], vec![2, 3, 1], vec![3, 2, 1], vec![4, 3, 2]],
            ),
            ("emea".to_string(), vec![vec![7, 8], vec![8, 7]]),
            (
                "apac".to_string(),
                vec![vec![17, 18, 19], vec![18, 17, 19], vec![19, 17, 18]],
            ),
        ]);
        SiteCommunityDecoder {
            oid_marker: 1594,
            aid_marker: 194,
            site_regions,
            failover_chains,
        }
    }
}

impl SiteCommunityDecoder {
    /// Local-preference and tier for a route without one, from where the origin site sits
    /// in the advertising site's failover chain. The lower-numbered site's firewall is
    /// primary. None when the origin site has no region or the chain does not rank it.
    pub fn infer_preference(&self, origin: u32, advertiser: u32) -> Option<(u32, &'static str)> {
        let region = self.site_regions.get(&origin)?;
        if origin == advertiser || advertiser < origin {
            let known = origin == advertiser
                || self
                    .failover_chains
                    .get(region)
                    .is_some_and(|chains| chains.iter().any(|c| c.first() == Some(&advertiser)));
            return known.then_some((LP_PRIMARY, "primary"));
        }

        let chain = self
            .failover_chains
            .get(region)?
            .iter()
            .find(|c| c.first() == Some(&advertiser))?;
        match chain.iter().position(|site| *site == origin)? {
            0 => Some((LP_PRIMARY, "primary")),
            1 => Some((LP_SECONDARY, "secondary")),
            _ => Some((LP_TERTIARY, "tertiary")),
        }
    }
}

impl CommunityDecoder for SiteCommunityDecoder {
    fn name(&self) -> &str {
        "site-community"
    }

    fn decode(&self, communities: &[String], local_pref: Option<u32>) -> Labels {
        let mut labels = Labels::new();
        let mut origin = None;
        let mut advertiser = None;

        for raw in communities {
            if CHILD_ORIGINATED.contains(&raw.trim()) {
                labels.insert("child_originated".to_string(), "true".to_string());
                continue;
            }
            let Ok(Community::Standard { asn, value }) = raw.parse::<Community>() else {
                continue;
            };
            if value == self.oid_marker {
                origin = Some(asn);
            } else if value == self.aid_marker {
                advertiser = Some(asn);
            } else if value == DEFAULT_ROUTE_MARKER && (1..=50).contains(&asn) {
                labels.insert("default_route_from".to_string(), format!("Site-{}", asn));
            }
        }

        if let Some(site) = origin {
            labels.insert("origin_site".to_string(), format!("Site-{}", site));
            if let Some(region) = self.site_regions.get(&site) {
                labels.insert("region".to_string(), region.clone());
            }
        }
        if let Some(site) = advertiser {
            labels.insert("advertising_site".to_string(), format!("Site-{}", site));
        }
        if let (Some(o), Some(a)) = (origin, advertiser) {
            labels.insert("readvertised".to_string(), (o != a).to_string());
        }
        match (local_pref, origin, advertiser) {
            (Some(lp), _, _) => {
                labels.insert("preference".to_string(), preference_tier(lp).to_string());
            }
            (None, Some(o), Some(a)) => {
                if let Some((lp, tier)) = self.infer_preference(o, a) {
                    labels.insert("preference".to_string(), tier.to_string());
                    labels.insert("inferred_local_pref".to_string(), lp.to_string());
                }
            }
            _ => {}
        }

        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_community() {
        assert_eq!(
            "7018:2500".parse::<Community>(),
            Ok(Community::Standard { asn: 7018, value: 2500 })
        );
        assert!(matches!("65000:1:2".parse::<Community>(), Ok(Community::Large { .. })));
        assert!(matches!("target:65000:100".parse::<Community>(), Ok(Community::Extended { .. })));
        assert!(matches!("NO-EXPORT".parse::<Community>(), Ok(Community::WellKnown(_))));
        assert!("garbage".parse::<Community>().is_err());
        assert!("1:x".parse::<Community>().is_err());
    }

    #[test]
    fn test_site_decoder_origin_and_advertiser() {
        let decoder = SiteCommunityDecoder::default();
        let labels = decoder.decode(&tags(&["1:1594", "3:194", "7018:2500"]), Some(200));

        assert_eq!(labels["origin_site"], "Site-1");
        assert_eq!(labels["advertising_site"], "Site-3");
        assert_eq!(labels["region"], "americas");
        assert_eq!(labels["readvertised"], "true");
        assert_eq!(labels["preference"], "primary");
    }

    #[test]
    fn test_site_decoder_tolerates_missing_and_malformed() {
        let decoder = SiteCommunityDecoder::default();
        assert!(decoder.decode(&[], None).is_empty());

        let labels = decoder.decode(&tags(&["not-a-community", "2:1594"]), None);
        assert_eq!(labels["origin_site"], "Site-2");
        assert!(!labels.contains_key("advertising_site"));
        assert!(!labels.contains_key("readvertised"));
        assert!(!labels.contains_key("preference"));
    }

    #[test]
    fn test_site_decoder_extras() {
        let decoder = SiteCommunityDecoder::default();
        let labels = decoder.decode(&tags(&["4:0", "41326:41326"]), None);
        assert_eq!(labels["default_route_from"], "Site-4");
        assert_eq!(labels["child_originated"], "true");
    }

    #[test]
    fn test_preference_inferred_from_failover_chain() {
        let decoder = SiteCommunityDecoder::default();

        // Site 2 decides; its chain [2, 3, 1] puts site 1 last
        let labels = decoder.decode(&tags(&["1:1594", "2:194"]), None);
        assert_eq!(labels["preference"], "tertiary");
        assert_eq!(labels["inferred_local_pref"], "50");

        // Local origin is always primary
        let labels = decoder.decode(&tags(&["3:1594", "3:194"]), None);
        assert_eq!(labels["preference"], "primary");
        assert_eq!(labels["inferred_local_pref"], "200");

        // Lower-numbered advertiser owns the primary firewall
        assert_eq!(decoder.infer_preference(3, 2), Some((200, "primary")));
        assert_eq!(decoder.infer_preference(3, 4), Some((150, "secondary")));
        assert_eq!(decoder.infer_preference(8, 7), Some((200, "primary")));
        // Unknown region or a chain that does not rank the origin
        assert_eq!(decoder.infer_preference(30, 2), None);
        assert_eq!(decoder.infer_preference(1, 7), None);

        // An explicit local-preference wins over the chain
        let labels = decoder.decode(&tags(&["1:1594", "2:194"]), Some(200));
        assert_eq!(labels["preference"], "primary");
        assert!(!labels.contains_key("inferred_local_pref"));
    }

    #[test]
    fn test_preference_tier() {
        assert_eq!(preference_tier(250), "primary");
        assert_eq!(preference_tier(200), "primary");
        assert_eq!(preference_tier(199), "secondary");
        assert_eq!(preference_tier(100), "secondary");
        assert_eq!(preference_tier(99), "tertiary");
        assert_eq!(preference_tier(50), "tertiary");
    }

    struct Fixed(&'static str, &'static str, &'static str);

    impl CommunityDecoder for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        fn decode(&self, _communities: &[String], _local_pref: Option<u32>) -> Labels {
            Labels::from([(self.1.to_string(), self.2.to_string())])
        }
    }

    #[test]
    fn test_registry_last_registered_wins() {
        let registry = DecoderRegistry::new()
            .with(Arc::new(SiteCommunityDecoder::default()))
            .with(Arc::new(Fixed("override", "preference", "gold")));

        let decoded = registry.decode(&tags(&["1:1594", "bad tag"]), Some(200));
        assert_eq!(decoded.labels["preference"], "gold");
        assert_eq!(decoded.labels["origin_site"], "Site-1");
        assert_eq!(decoded.malformed, vec!["bad tag".to_string()]);
        assert_eq!(registry.names(), vec!["site-community", "override"]);
    }
}
