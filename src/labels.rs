//! Display strings for enum values. Identity lives in the enums; presentation lives here.

use crate::status::SessionStatus;
use crate::types::SenderRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lang {
    En,
    Ru,
    Es,
}

impl Lang {
    /// Unknown codes fall back to English.
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_lowercase().get(..2) {
            Some("ru") => Lang::Ru,
            Some("es") => Lang::Es,
            _ => Lang::En,
        }
    }
}

/// Service notices the core sends on its own behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    RateLimited,
    HandedToConsultant,
}

pub fn status_label(status: SessionStatus, lang: Lang) -> &'static str {
    match (status, lang) {
        (SessionStatus::InProgress, Lang::En) => "In progress",
        (SessionStatus::InProgress, Lang::Ru) => "В процессе",
        (SessionStatus::InProgress, Lang::Es) => "En curso",
        (SessionStatus::SuccessfullyClosed, Lang::En) => "Successfully closed",
        (SessionStatus::SuccessfullyClosed, Lang::Ru) => "Успешно завершён",
        (SessionStatus::SuccessfullyClosed, Lang::Es) => "Cerrado con éxito",
        (SessionStatus::ClosedWithoutResponse, Lang::En) => "Closed without response",
        (SessionStatus::ClosedWithoutResponse, Lang::Ru) => "Закрыт без ответа",
        (SessionStatus::ClosedWithoutResponse, Lang::Es) => "Cerrado sin respuesta",
        (SessionStatus::ForcedClosed, Lang::En) => "Closed by operator",
        (SessionStatus::ForcedClosed, Lang::Ru) => "Закрыт оператором",
        (SessionStatus::ForcedClosed, Lang::Es) => "Cerrado por el operador",
    }
}

pub fn role_label(role: SenderRole, lang: Lang) -> &'static str {
    match (role, lang) {
        (SenderRole::Client, Lang::En) => "Client",
        (SenderRole::Client, Lang::Ru) => "Клиент",
        (SenderRole::Client, Lang::Es) => "Cliente",
        (SenderRole::AiAssistant, Lang::En) => "AI assistant",
        (SenderRole::AiAssistant, Lang::Ru) => "ИИ-ассистент",
        (SenderRole::AiAssistant, Lang::Es) => "Asistente IA",
        (SenderRole::Consultant, Lang::En) => "Consultant",
        (SenderRole::Consultant, Lang::Ru) => "Консультант",
        (SenderRole::Consultant, Lang::Es) => "Consultor",
    }
}

pub fn notice(notice: Notice, lang: Lang) -> &'static str {
    match (notice, lang) {
        (Notice::RateLimited, Lang::En) => {
            "You are sending messages too quickly. Please wait a moment."
        }
        (Notice::RateLimited, Lang::Ru) => {
            "Вы отправляете сообщения слишком часто. Пожалуйста, подождите немного."
        }
        (Notice::RateLimited, Lang::Es) => {
            "Estás enviando mensajes demasiado rápido. Espera un momento, por favor."
        }
        (Notice::HandedToConsultant, Lang::En) => {
            "I'm passing your question to a consultant. They will reply here shortly."
        }
        (Notice::HandedToConsultant, Lang::Ru) => {
            "Я передаю ваш вопрос консультанту. Он скоро ответит здесь."
        }
        (Notice::HandedToConsultant, Lang::Es) => {
            "Paso tu consulta a un asesor. Te responderá aquí en breve."
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_codes_fold_to_known_tables() {
        assert_eq!(Lang::from_code("ru_RU"), Lang::Ru);
        assert_eq!(Lang::from_code("ES"), Lang::Es);
        assert_eq!(Lang::from_code("de"), Lang::En);
        assert_eq!(Lang::from_code(""), Lang::En);
    }

    #[test]
    fn labels_are_distinct_per_language() {
        let en = status_label(SessionStatus::ClosedWithoutResponse, Lang::En);
        let ru = status_label(SessionStatus::ClosedWithoutResponse, Lang::Ru);
        assert_ne!(en, ru);
        assert_eq!(role_label(SenderRole::Consultant, Lang::Es), "Consultor");
    }
}
