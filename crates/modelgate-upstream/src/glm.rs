use std::sync::Arc;

use crate::client::UpstreamClient;
use crate::openai::OpenAiCompatAdapter;

const GLM_BASE_URL: &str = "https://open.bigmodel.cn/api/paas/v4";
const GLM_CHAT_PATH: &str = "/chat/completions";

/// GLM serves an OpenAI-compatible wire at its own base URL.
pub fn glm_adapter(client: Arc<dyn UpstreamClient>) -> OpenAiCompatAdapter {
    OpenAiCompatAdapter::compat("glm", GLM_BASE_URL, GLM_CHAT_PATH, client)
}
