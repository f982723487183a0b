use crate::core::config::{CoreConfig, EMBEDDING_DIM};
use crate::core::errors::CoreError;

/// Startup validation. Any violation is fatal (`ConfigInvalid`).
pub fn validate(config: &CoreConfig) -> Result<(), CoreError> {
    if config.embedding.dim != EMBEDDING_DIM {
        return Err(CoreError::ConfigInvalid(format!(
            "embedding.dim must be {}, got {}",
            EMBEDDING_DIM, config.embedding.dim
        )));
    }
    if config.embedding.requests_per_minute == 0 {
        return Err(invalid("embedding.requests_per_minute must be positive"));
    }
    if config.embedding.timeout_ms == 0 {
        return Err(invalid("embedding.timeout_ms must be positive"));
    }

    if config.retrieval.doc_k == 0 || config.retrieval.msg_k == 0 || config.retrieval.global_k == 0
    {
        return Err(invalid("retrieval match counts must be positive"));
    }
    if !(0.0..=1.0).contains(&config.retrieval.threshold) {
        return Err(invalid("retrieval.threshold must be within [0, 1]"));
    }
    if !(0.0..=1.0).contains(&config.retrieval.global_min_quality) {
        return Err(invalid("retrieval.global_min_quality must be within [0, 1]"));
    }
    if config.retrieval.deadline_ms == 0 {
        return Err(invalid("retrieval.deadline_ms must be positive"));
    }

    if config.context.max_chars == 0 {
        return Err(invalid("context.max_chars must be positive"));
    }

    if config.chunking.target_chars == 0 {
        return Err(invalid("chunking.target_chars must be positive"));
    }
    if config.chunking.overlap_chars >= config.chunking.target_chars {
        return Err(invalid(
            "chunking.overlap_chars must be smaller than chunking.target_chars",
        ));
    }
    if config.chunking.max_chunks_per_doc == 0 {
        return Err(invalid("chunking.max_chunks_per_doc must be positive"));
    }

    if config.generation.stream_deadline_ms == 0 || config.generation.completion_timeout_ms == 0 {
        return Err(invalid("generation deadlines must be positive"));
    }
    if config.generation.max_tokens == 0 {
        return Err(invalid("generation.max_tokens must be positive"));
    }

    if config.web_search.max_results == 0 {
        return Err(invalid("web_search.max_results must be positive"));
    }
    if config.web_search.timeout_ms == 0 {
        return Err(invalid("web_search.timeout_ms must be positive"));
    }

    Ok(())
}

fn invalid(message: &str) -> CoreError {
    CoreError::ConfigInvalid(message.to_string())
}
