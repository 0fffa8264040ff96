//! Backend endpoint table.

use url::Url;

use crate::TransportResult;

const VISITS_PATH: &str = "api/public/visits/";

/// Builds absolute URLs for every backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    base: Url,
}

impl Endpoints {
    /// Parse the backend base URL (`https://host[/prefix]`).
    ///
    /// # Errors
    /// Returns an error if `api_base` is not an absolute URL.
    pub fn new(api_base: &str) -> TransportResult<Self> {
        let mut raw = api_base.trim().trim_end_matches('/').to_string();
        raw.push('/');
        let base = Url::parse(&raw)?.join(VISITS_PATH)?;
        Ok(Self { base })
    }

    fn build(&self, path: &str, query: &[(&str, &str)]) -> String {
        // `path` values are fixed relative segments, join cannot fail for them.
        let mut url = self.base.join(path).unwrap_or_else(|_| self.base.clone());
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        url.into()
    }

    /// Identity issuance (anonymous).
    #[must_use]
    pub fn issue(&self, subject: &str) -> String {
        self.build("issue", &[("page", subject)])
    }

    /// Visit tracking; answers with the visitor profile.
    #[must_use]
    pub fn track(&self, subject: &str) -> String {
        self.build("track", &[("page", subject)])
    }

    /// Identity refresh / current profile.
    #[must_use]
    pub fn me(&self, subject: &str) -> String {
        self.build("me", &[("page", subject)])
    }

    /// Aggregated insights for the visitor.
    #[must_use]
    pub fn insights(&self, subject: &str) -> String {
        self.build("insights/me", &[("page", subject)])
    }

    /// Total visits.
    #[must_use]
    pub fn total(&self, subject: &str) -> String {
        self.build("total", &[("page", subject)])
    }

    /// Online-now count.
    #[must_use]
    pub fn online(&self, subject: &str) -> String {
        self.build("online", &[("page", subject)])
    }

    /// Event submission. The subject travels in the body.
    #[must_use]
    pub fn event(&self) -> String {
        self.build("event", &[])
    }

    /// Device-link code issuance.
    #[must_use]
    pub fn link_issue(&self, subject: &str) -> String {
        self.build("link/issue", &[("page", subject)])
    }

    /// Device-link code exchange.
    #[must_use]
    pub fn link_consume(&self, subject: &str, code: &str) -> String {
        self.build("link/consume", &[("page", subject), ("code", code)])
    }

    /// Push subscription. The credential rides in the query string.
    #[must_use]
    pub fn stream(&self, subject: &str, credential: &str) -> String {
        self.build("stream", &[("page", subject), ("vid", credential.trim())])
    }
}
