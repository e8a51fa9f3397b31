pub mod conversations;
pub mod responses;

pub use conversations::{
    scoped_conversation_key, ConversationStorage, MemoryConversationStorage,
    SharedConversationStorage,
};
pub use responses::{
    clamp_list_limit, MemoryResponseStorage, ResponseList, ResponseStorage, SharedResponseStorage,
};
