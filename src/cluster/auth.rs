//! Node-to-node authentication.
//!
//! Cluster calls carry `Authorization: Node <node-id>:<secret>`. The secret
//! is shared by every node of the cluster and compared by SHA-256 digest in
//! constant time. A successful check yields a [`NodeCredential`], which is
//! the only way to call [`ClusterControl`](super::ClusterControl).

use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};

/// Authorization scheme used by cluster calls.
pub const NODE_AUTH_SCHEME: &str = "Node";

/// Proof that a caller authenticated as a cluster node.
///
/// Only [`NodeAuthenticator`] and the local engine can create one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCredential {
    node_id: String,
}

impl NodeCredential {
    pub(crate) fn local(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }

    /// Calling node.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

/// Verifies node authorization headers against the cluster secret.
#[derive(Clone)]
pub struct NodeAuthenticator {
    secret_digest: Option<Vec<u8>>,
}

impl std::fmt::Debug for NodeAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeAuthenticator")
            .field("configured", &self.secret_digest.is_some())
            .finish()
    }
}

fn digest(value: &str) -> Vec<u8> {
    Sha256::digest(value.as_bytes()).to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl NodeAuthenticator {
    /// Creates an authenticator. Without a secret every call is rejected.
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            secret_digest: secret.filter(|s| !s.is_empty()).map(digest),
        }
    }

    /// Builds the header value a node sends.
    ///
    /// ```
    /// use taskweave::cluster::NodeAuthenticator;
    ///
    /// let header = NodeAuthenticator::authorization_header("node-a", "s3cret");
    /// assert_eq!(header, "Node node-a:s3cret");
    ///
    /// let auth = NodeAuthenticator::new(Some("s3cret"));
    /// let credential = auth.authenticate(Some(&header)).unwrap();
    /// assert_eq!(credential.node_id(), "node-a");
    /// assert!(auth.authenticate(None).is_err());
    /// ```
    pub fn authorization_header(node_id: &str, secret: &str) -> String {
        format!("{NODE_AUTH_SCHEME} {node_id}:{secret}")
    }

    /// Checks an `Authorization` header value.
    ///
    /// # Errors
    ///
    /// [`EngineError::Unauthorized`] when the header is absent, malformed,
    /// carries the wrong secret, or no secret is configured.
    pub fn authenticate(&self, header: Option<&str>) -> Result<NodeCredential> {
        let Some(expected) = self.secret_digest.as_deref() else {
            return Err(EngineError::Unauthorized(
                "cluster secret is not configured".to_string(),
            ));
        };
        let header = header
            .ok_or_else(|| EngineError::Unauthorized("no node credential".to_string()))?;
        let token = header
            .strip_prefix(NODE_AUTH_SCHEME)
            .and_then(|rest| rest.strip_prefix(' '))
            .ok_or_else(|| EngineError::Unauthorized("not a node credential".to_string()))?;
        let (node_id, secret) = token
            .split_once(':')
            .filter(|(node_id, _)| !node_id.is_empty())
            .ok_or_else(|| EngineError::Unauthorized("malformed node credential".to_string()))?;

        if !constant_time_eq(&digest(secret), expected) {
            tracing::warn!(caller = node_id, "node credential rejected");
            return Err(EngineError::Unauthorized(format!(
                "invalid credential for node {node_id}"
            )));
        }
        Ok(NodeCredential::local(node_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_secret() {
        let auth = NodeAuthenticator::new(Some("secret"));
        let header = NodeAuthenticator::authorization_header("node-b", "secret");
        assert_eq!(auth.authenticate(Some(&header)).unwrap().node_id(), "node-b");
    }

    #[test]
    fn rejects_wrong_or_missing_credentials() {
        let auth = NodeAuthenticator::new(Some("secret"));
        for header in [
            None,
            Some("Bearer abc"),
            Some("Node "),
            Some("Node node-b"),
            Some("Node :secret"),
            Some("Node node-b:wrong"),
            Some("Nodenode-b:secret"),
        ] {
            let err = auth.authenticate(header).unwrap_err();
            assert!(matches!(err, EngineError::Unauthorized(_)), "{header:?}");
        }
    }

    #[test]
    fn unconfigured_secret_rejects_everything() {
        let auth = NodeAuthenticator::new(None);
        let header = NodeAuthenticator::authorization_header("node-b", "");
        assert!(auth.authenticate(Some(&header)).is_err());
        assert!(NodeAuthenticator::new(Some("")).authenticate(Some(&header)).is_err());
    }

    #[test]
    fn secret_may_contain_colons() {
        let auth = NodeAuthenticator::new(Some("a:b:c"));
        let header = NodeAuthenticator::authorization_header("node-b", "a:b:c");
        assert!(auth.authenticate(Some(&header)).is_ok());
    }
}
