use http::{Method, StatusCode};

/// Which exchanges the front puts through the cache mediators.
pub struct CachePolicy;

impl CachePolicy {
    /// Only GET goes through the cache. HEAD shares GET's fingerprint but
    /// has no body to store, so it is forwarded untouched.
    pub fn is_cacheable(method: &Method) -> bool {
        *method == Method::GET
    }

    /// Upstream replies worth collecting. Anything else leaves the entry pending.
    pub fn is_storable(status: StatusCode) -> bool {
        status.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_get_is_cacheable() {
        assert!(CachePolicy::is_cacheable(&Method::GET));
        assert!(!CachePolicy::is_cacheable(&Method::HEAD));
        assert!(!CachePolicy::is_cacheable(&Method::POST));
    }

    #[test]
    fn only_success_is_storable() {
        assert!(CachePolicy::is_storable(StatusCode::OK));
        assert!(!CachePolicy::is_storable(StatusCode::BAD_GATEWAY));
        assert!(!CachePolicy::is_storable(StatusCode::NOT_FOUND));
    }
}
