use murmur_llm::{ProviderError, TurnId};
use snafu::Snafu;

use crate::store::StoreError;

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("message is empty"))]
    EmptyInput { stage: &'static str },
    #[snafu(display("message is {length} characters, the limit is {limit}"))]
    InputTooLong {
        stage: &'static str,
        length: usize,
        limit: usize,
    },
    #[snafu(display("{turn_id} is still in progress"))]
    Busy {
        stage: &'static str,
        turn_id: TurnId,
    },
    #[snafu(display("there is no user message to regenerate a reply for"))]
    NothingToRegenerate { stage: &'static str },
    #[snafu(display("chat store failed on `{stage}`, {source}"))]
    Store {
        stage: &'static str,
        source: StoreError,
    },
    #[snafu(display("provider failed on `{stage}`, {source}"))]
    Provider {
        stage: &'static str,
        source: ProviderError,
    },
}

