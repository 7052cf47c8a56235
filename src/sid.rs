use std::fmt;
use std::sync::Arc;

/// Identifier of a [`Socket`](crate::Socket).
///
/// On the default namespace it is the transport connection id itself; on any
/// other namespace it is `<nsp>#<conn-id>`, which keeps ids unique across the
/// whole process while staying derivable by the peer. Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sid(Arc<str>);

impl Sid {
    pub(crate) fn new(nsp: &str, conn_id: &str) -> Self {
        if nsp == "/" {
            Self(conn_id.into())
        } else {
            Self(format!("{nsp}#{conn_id}").into())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Sid {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}
