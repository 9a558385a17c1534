use minijinja::{context, Environment};

const ANSWER_SYSTEM_TEMPLATE: &str = include_str!("prompts/answer_system.j2");

pub struct AnswerPromptContext<'a> {
    pub company_name: &'a str,
    pub channel: &'a str,
    pub user_language: &'a str,
    pub client_name: &'a str,
}

pub fn render_answer_system_prompt(ctx: &AnswerPromptContext<'_>) -> String {
    let mut env = Environment::new();
    if env
        .add_template("answer_system", ANSWER_SYSTEM_TEMPLATE)
        .is_err()
    {
        return fallback_answer_system_prompt(ctx);
    }

    let Ok(template) = env.get_template("answer_system") else {
        return fallback_answer_system_prompt(ctx);
    };

    template
        .render(context! {
            company_name => non_empty_or(ctx.company_name, "our company"),
            channel => ctx.channel,
            user_language => ctx.user_language.trim(),
            client_name => ctx.client_name.trim(),
        })
        .unwrap_or_else(|_| fallback_answer_system_prompt(ctx))
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value.trim()
    }
}

fn fallback_answer_system_prompt(ctx: &AnswerPromptContext<'_>) -> String {
    format!(
        "You are the customer support assistant of \"{}\". Be accurate and concise; never invent facts.\n\
         Reply in the client's language ({}).\n\
         Respond with JSON: {{\"reply\": string, \"confidence\": number, \"outOfScope\": bool, \"consultantCall\": bool}}.\n\
         Set consultantCall=true when the client asks for a human.\n",
        non_empty_or(ctx.company_name, "our company"),
        non_empty_or(ctx.user_language, "en"),
    )
}
