use std::fmt::Debug;
use std::sync::Arc;

use tcpshaper_common::ShaperError;

use super::bucket::TokenBucket;
use super::context::WaitContext;
use super::setting::RateSetting;

/// One level of a bandwidth budget hierarchy.
///
/// Every admission has to clear the parent chain first (root to leaf)
/// and only then the node's own bucket. A server-wide root with one child
/// per connection thus caps both the aggregate and each connection.
pub struct LimiterNode {
    bucket: TokenBucket,
    setting: Arc<RateSetting>,
    parent: Option<Arc<LimiterNode>>,
}

impl LimiterNode {
    pub fn root(setting: Arc<RateSetting>) -> Arc<Self> {
        Self::new(None, setting)
    }

    fn new(parent: Option<Arc<LimiterNode>>, setting: Arc<RateSetting>) -> Arc<Self> {
        Arc::new(Self {
            bucket: TokenBucket::new(setting.snapshot()),
            setting,
            parent,
        })
    }

    /// Creates a node nested inside this one's budget. `self` is left untouched.
    pub fn child(self: &Arc<Self>, setting: Arc<RateSetting>) -> Arc<Self> {
        Self::new(Some(self.clone()), setting)
    }

    pub fn setting(&self) -> &Arc<RateSetting> {
        &self.setting
    }

    pub fn parent(&self) -> Option<&Arc<LimiterNode>> {
        self.parent.as_ref()
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    /// This node followed by its ancestors
    fn lineage(&self) -> impl Iterator<Item = &LimiterNode> {
        std::iter::successors(Some(self), |node| node.parent.as_deref())
    }

    /// Largest request this node can currently admit: the smallest
    /// burst anywhere along the chain, ignoring unlimited levels.
    pub fn max_admissible(&self) -> u64 {
        self.lineage()
            .map(|node| node.setting.snapshot())
            .filter(|values| !values.limit.is_unlimited())
            .map(|values| values.burst)
            .min()
            .unwrap_or(u64::MAX)
    }

    /// Waits until `n` bytes may pass through this node and all of its
    /// ancestors. The first failing level aborts the whole chain; levels
    /// below it are never charged.
    pub async fn admit(&self, n: u64, ctx: &WaitContext) -> Result<(), ShaperError> {
        let chain = self.lineage().collect::<Vec<_>>();
        for node in chain.into_iter().rev() {
            node.admit_local(n, ctx).await?;
        }
        Ok(())
    }

    async fn admit_local(&self, n: u64, ctx: &WaitContext) -> Result<(), ShaperError> {
        // Pick up limit changes lazily instead of subscribing to them
        self.bucket.configure(self.setting.snapshot());
        self.bucket.admit(n, ctx).await
    }
}

impl Debug for LimiterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterNode")
            .field("setting", &self.setting)
            .field("parent", &self.parent)
            .finish()
    }
}
