//! Static topic catalog and the per-request set of authorized topics.

use std::collections::{HashMap, HashSet};

use crate::config::{PrintSettings, TopicSettings};

/// Topics a requester may print. Computed outside the dispatch pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requester {
    authorized_topics: HashSet<String>,
}

impl Requester {
    pub fn is_authorized(&self, topic: &str) -> bool {
        self.authorized_topics.contains(topic)
    }
}

#[derive(Debug, Clone)]
struct TopicEntry {
    disclaimer: Option<String>,
    public: bool,
}

#[derive(Debug, Clone)]
pub struct TopicCatalog {
    topics: HashMap<String, TopicEntry>,
    default_disclaimer: String,
}

impl TopicCatalog {
    pub fn new(topics: &[TopicSettings], print: &PrintSettings) -> Self {
        let topics = topics
            .iter()
            .map(|topic| {
                (
                    topic.name.clone(),
                    TopicEntry {
                        disclaimer: topic.disclaimer.clone(),
                        public: topic.public,
                    },
                )
            })
            .collect();

        Self {
            topics,
            default_disclaimer: print.default_disclaimer.clone(),
        }
    }

    /// Requester for a request: public topics plus the comma-separated
    /// `granted` list forwarded by a trusted proxy. Unknown names are ignored.
    pub fn requester(&self, granted: Option<&str>) -> Requester {
        let public = self
            .topics
            .iter()
            .filter(|(_, entry)| entry.public)
            .map(|(name, _)| name.clone());

        let granted = granted
            .into_iter()
            .flat_map(|list| list.split(','))
            .map(str::trim)
            .filter(|name| self.topics.contains_key(*name))
            .map(str::to_string);

        Requester {
            authorized_topics: public.chain(granted).collect(),
        }
    }

    /// Disclaimer for a page: the topic's own when known and authorized, else the default.
    pub fn disclaimer_for(&self, topic: Option<&str>, requester: &Requester) -> &str {
        topic
            .filter(|topic| requester.is_authorized(topic))
            .and_then(|topic| self.topics.get(topic))
            .and_then(|entry| entry.disclaimer.as_deref())
            .unwrap_or(&self.default_disclaimer)
    }
}
