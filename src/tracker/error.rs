use thiserror::Error;

use crate::db::DatabaseError;
use crate::discord::ChatError;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("unsupported snapshot schema version {0}")]
    SchemaMismatch(u64),
    #[error("malformed snapshot envelope: {0}")]
    Malformed(String),
    #[error("message carries no snapshot envelope")]
    NoEnvelope,
    #[error("snapshot attachment could not be read: {0}")]
    Unreadable(String),
    #[error("no snapshot channel configured")]
    NotConfigured,
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("store error: {0}")]
    Store(#[from] DatabaseError),
    #[error("chat error: {0}")]
    Chat(#[from] ChatError),
    #[error("alert target unavailable: {0}")]
    Unavailable(String),
    #[error("caller is not allowed to run this command")]
    Unauthorized,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

impl TrackerError {
    pub fn is_store(&self) -> bool {
        matches!(self, TrackerError::Store(_))
    }

    /// Short French message shown to the user who ran a command.
    pub fn user_message(&self) -> String {
        match self {
            TrackerError::Store(_) => "Base de données indisponible, réessaie plus tard.".to_string(),
            TrackerError::Chat(_) => "Discord n'a pas répondu, réessaie plus tard.".to_string(),
            TrackerError::Unavailable(reason) => format!("Alerte impossible : {reason}."),
            TrackerError::Unauthorized => "Tu n'as pas la permission d'utiliser cette commande.".to_string(),
            TrackerError::InvalidInput(reason) => format!("Requête invalide : {reason}."),
            TrackerError::Snapshot(SnapshotError::NotConfigured) => {
                "Aucun salon de snapshot n'est configuré.".to_string()
            }
            TrackerError::Snapshot(_) => "Le snapshot a échoué.".to_string(),
        }
    }
}
