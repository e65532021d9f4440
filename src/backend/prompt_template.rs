use serde_json::Value;

/// 한 대화 턴의 화자
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

/// 세션 대화 기록의 한 항목
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }

    fn render(&self) -> String {
        format!("{}: {}", self.role.label(), self.content)
    }
}

/// 백엔드에 전달할 프롬프트 템플릿 생성기
///
/// 세션 대화 기록과 OpenAI 스타일 메시지 배열을 단일 프롬프트 문자열로 변환합니다.
pub struct PromptTemplate;

impl PromptTemplate {
    /// 세션 대화 기록 + 새 사용자 입력으로 컨텍스트 생성
    ///
    /// 시스템 프롬프트는 백엔드 핸들 생성 시 instructions로 전달되므로 여기에 포함하지 않습니다.
    pub fn conversation_context(transcript: &[Turn], new_prompt: &str) -> String {
        let next = Turn::user(new_prompt).render();
        if transcript.is_empty() {
            return next;
        }

        let mut context = transcript
            .iter()
            .map(Turn::render)
            .collect::<Vec<_>>()
            .join("\n");
        context.push('\n');
        context.push_str(&next);
        context
    }

    /// OpenAI 메시지 배열을 (프롬프트, 시스템 프롬프트)로 변환
    ///
    /// - 첫 번째 system 메시지가 시스템 프롬프트가 됨
    /// - system 메시지는 본문에서 제외
    /// - role/content가 문자열이 아닌 항목은 무시
    pub fn from_chat_messages(messages: &[Value]) -> (String, Option<String>) {
        let mut prompt = String::new();
        let mut system_prompt = None;

        for message in messages {
            let (Some(role), Some(content)) = (
                message.get("role").and_then(Value::as_str),
                message.get("content").and_then(Value::as_str),
            ) else {
                continue;
            };

            match role {
                "system" => {
                    if system_prompt.is_none() {
                        system_prompt = Some(content.to_string());
                    }
                }
                "user" => prompt.push_str(&format!("User: {}\n\n", content)),
                "assistant" => prompt.push_str(&format!("Assistant: {}\n\n", content)),
                _ => prompt.push_str(&format!("{}\n\n", content)),
            }
        }

        (prompt.trim().to_string(), system_prompt)
    }
}
