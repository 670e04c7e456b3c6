use crate::crypto::CryptoError;
use crate::odoo::OdooError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Odoo(#[from] OdooError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("mapping error: {0}")]
    Mapping(String),
}
