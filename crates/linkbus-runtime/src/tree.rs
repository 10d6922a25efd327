//! In-memory node tree
//!
//! Links are mounted as children of the downstream node. A display name is
//! owned by the first identifier that claimed it; another identifier with
//! the same name is mounted under the name suffixed with the start of its
//! key hash. A claim is provisional until its link authenticates; a
//! provisional claim is given back when the handshake is abandoned.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use linkbus_broker::{ClientSession, NodeTree};
use linkbus_core::{positional, DsId, LINK_DATA_TAG, ROOT_PATH};

/// Hash characters appended to a contested display name
const CONFLICT_SUFFIX_LEN: usize = 8;

struct Mount {
    owner: DsId,
    confirmed: bool,
}

pub struct LinkTree {
    prefix: String,
    /// Mounted name -> owning link
    links: DashMap<String, Mount>,
}

impl LinkTree {
    pub fn new(prefix: impl Into<String>) -> Self {
        LinkTree {
            prefix: prefix.into(),
            links: DashMap::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Broker path of a mounted link
    pub fn link_path(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.links.contains_key(name)
    }

    /// Identifier owning a mounted name
    pub fn owner(&self, name: &str) -> Option<DsId> {
        self.links.get(name).map(|e| e.owner.clone())
    }

    /// Whether the owner of `name` has authenticated
    pub fn is_confirmed(&self, name: &str) -> bool {
        self.links.get(name).map_or(false, |e| e.confirmed)
    }

    /// Claim `name` for `ds_id`; `true` if it is (now) owned by `ds_id`
    fn claim(&self, name: &str, ds_id: &DsId) -> bool {
        match self.links.entry(name.to_string()) {
            Entry::Occupied(e) => e.get().owner == *ds_id,
            Entry::Vacant(e) => {
                e.insert(Mount {
                    owner: ds_id.clone(),
                    confirmed: false,
                });
                true
            }
        }
    }

    /// Link name segment of a broker path, mounted or not
    fn mounted_name<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        let name = rest.split('/').next().unwrap_or(rest);
        (!name.is_empty()).then_some(name)
    }

    /// Split a broker path into the mounted link name and the
    /// producer-relative path
    ///
    /// `/downstream/weather/temp` routes to `("weather", "/temp")`; the link
    /// node itself routes to `(name, "/")`.
    pub fn route(&self, path: &str) -> Option<(String, String)> {
        let name = self.mounted_name(path)?;
        if !self.contains(name) {
            return None;
        }
        let remainder = &path[self.prefix.len() + 1 + name.len()..];
        let remainder = if remainder.is_empty() {
            ROOT_PATH.to_string()
        } else {
            remainder.to_string()
        };
        Some((name.to_string(), remainder))
    }

    /// Mounted name of a session, taken from its assigned path
    pub fn link_name(&self, session: &ClientSession) -> Option<String> {
        self.route(session.path()).map(|(name, _)| name)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

impl NodeTree for LinkTree {
    fn assign_offline_path(&self, ds_id: &DsId) -> String {
        let name = ds_id.display_name();
        if self.claim(name, ds_id) {
            return self.link_path(name);
        }

        let suffix = &ds_id.hash_segment()[..CONFLICT_SUFFIX_LEN];
        let alternate = format!("{}-{}", name, suffix);
        if !self.claim(&alternate, ds_id) {
            tracing::warn!("{} shares {} with another identifier", ds_id, alternate);
        }
        self.link_path(&alternate)
    }

    fn confirm_path(&self, session: &ClientSession) {
        let Some(name) = self.mounted_name(session.path()) else {
            return;
        };
        match self.links.entry(name.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().owner == *session.ds_id() {
                    e.get_mut().confirmed = true;
                } else {
                    tracing::warn!("{} lost {} before authenticating", session.ds_id(), name);
                }
            }
            Entry::Vacant(e) => {
                e.insert(Mount {
                    owner: session.ds_id().clone(),
                    confirmed: true,
                });
            }
        }
    }

    fn release_path(&self, session: &ClientSession) {
        let Some(name) = self.mounted_name(session.path()) else {
            return;
        };
        let released = self
            .links
            .remove_if(name, |_, m| m.owner == *session.ds_id() && !m.confirmed)
            .is_some();
        if released {
            tracing::debug!("released {} reserved by {}", name, session.ds_id());
        }
    }

    fn root_link_data_update(&self, session: &ClientSession) -> Option<Value> {
        session
            .link_data()
            .map(|data| positional(LINK_DATA_TAG, data.clone()))
    }
}

impl std::fmt::Debug for LinkTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkTree")
            .field("prefix", &self.prefix)
            .field("links", &self.links.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkbus_broker::testing::TestLink;
    use proptest::prelude::*;

    #[test]
    fn test_same_link_keeps_path() {
        let tree = LinkTree::new("/downstream");
        let link = TestLink::responder("weather");

        let first = tree.assign_offline_path(&link.ds_id());
        let again = tree.assign_offline_path(&link.ds_id());
        assert_eq!(first, "/downstream/weather");
        assert_eq!(first, again);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_name_conflict_gets_hash_suffix() {
        let tree = LinkTree::new("/downstream");
        let owner = TestLink::responder("weather");
        let other = TestLink::responder("weather");

        tree.assign_offline_path(&owner.ds_id());
        let path = tree.assign_offline_path(&other.ds_id());

        let other_id = other.ds_id();
        assert_eq!(path, format!("/downstream/weather-{}", &other_id.hash_segment()[..8]));
        assert_eq!(tree.owner("weather"), Some(owner.ds_id()));
    }

    #[test]
    fn test_unconfirmed_claim_released() {
        let fx = linkbus_broker::testing::Fixture::new();
        let tree = LinkTree::new("/downstream");
        let squatter = TestLink::responder("weather");
        let genuine = TestLink::responder("weather");

        let path = tree.assign_offline_path(&squatter.ds_id());
        assert_eq!(path, "/downstream/weather");
        let session = fx.connect(&squatter);
        tree.release_path(&session);
        assert!(!tree.contains("weather"));

        assert_eq!(tree.assign_offline_path(&genuine.ds_id()), "/downstream/weather");
    }

    #[test]
    fn test_confirmed_claim_survives_release() {
        let fx = linkbus_broker::testing::Fixture::new();
        let tree = LinkTree::new("/downstream");
        let link = TestLink::responder("weather");

        tree.assign_offline_path(&link.ds_id());
        let session = fx.connect(&link);
        tree.confirm_path(&session);
        tree.release_path(&session);

        assert!(tree.is_confirmed("weather"));
        assert_eq!(tree.owner("weather"), Some(link.ds_id()));
    }

    #[test]
    fn test_release_ignores_other_owner() {
        let fx = linkbus_broker::testing::Fixture::new();
        let tree = LinkTree::new("/downstream");
        let owner = TestLink::responder("weather");
        let other = TestLink::responder("weather");

        tree.assign_offline_path(&owner.ds_id());
        // The fixture mounts every link at `/downstream/<name>`
        let session = fx.connect(&other);
        tree.release_path(&session);

        assert_eq!(tree.owner("weather"), Some(owner.ds_id()));
    }

    #[test]
    fn test_route() {
        let tree = LinkTree::new("/downstream");
        tree.assign_offline_path(&TestLink::responder("weather").ds_id());

        assert_eq!(
            tree.route("/downstream/weather/city/temp"),
            Some(("weather".to_string(), "/city/temp".to_string()))
        );
        assert_eq!(
            tree.route("/downstream/weather"),
            Some(("weather".to_string(), "/".to_string()))
        );
        assert_eq!(tree.route("/downstream/unknown/x"), None);
        assert_eq!(tree.route("/downstream"), None);
        assert_eq!(tree.route("/downstreamweather"), None);
        assert_eq!(tree.route("/sys/weather"), None);
        assert_eq!(tree.route("/downstream//x"), None);
    }

    proptest! {
        #[test]
        fn prop_route_splits_mounted_paths(rel in "(/[a-z0-9]{1,6}){0,4}") {
            let tree = LinkTree::new("/downstream");
            tree.assign_offline_path(&TestLink::responder("weather").ds_id());

            let (name, remainder) = tree
                .route(&format!("/downstream/weather{}", rel))
                .expect("mounted link routes");
            prop_assert_eq!(name, "weather");
            if rel.is_empty() {
                prop_assert_eq!(remainder, "/");
            } else {
                prop_assert_eq!(remainder, rel);
            }
        }
    }

    #[test]
    fn test_root_link_data() {
        let tree = LinkTree::new("/downstream");
        let fx = linkbus_broker::testing::Fixture::new();
        let plain = fx.connect(&TestLink::responder("plain"));
        let tagged = fx.connect(
            &TestLink::responder("tagged").with_link_data(serde_json::json!({"rack": 2})),
        );

        assert_eq!(tree.root_link_data_update(&plain), None);
        assert_eq!(
            tree.root_link_data_update(&tagged),
            Some(serde_json::json!(["$linkData", {"rack": 2}]))
        );
    }
}
