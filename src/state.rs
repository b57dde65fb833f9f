/// Identifies one Paxos instance (the key a value is decided for).
pub trait Identifier: std::hash::Hash
    + std::fmt::Debug
    + serde::Serialize
    + serde::de::DeserializeOwned
    + Clone
    + Eq
    + Send
    + Sync
    + 'static
{
}

impl<T> Identifier for T where T: std::hash::Hash
    + std::fmt::Debug
    + serde::Serialize
    + serde::de::DeserializeOwned
    + Clone
    + Eq
    + Send
    + Sync
    + 'static
{
}

/// Value that can be proposed and decided.
pub trait Value: std::fmt::Debug
    + serde::Serialize
    + serde::de::DeserializeOwned
    + Clone
    + PartialEq
    + Send
    + Sync
    + 'static
{
}

impl<T> Value for T where T: std::fmt::Debug
    + serde::Serialize
    + serde::de::DeserializeOwned
    + Clone
    + PartialEq
    + Send
    + Sync
    + 'static
{
}

/// Participant identifier within the fixed roster.
pub type NodeId = usize;

/// Logical message channel between participants.
pub type PipelineId = u32;
