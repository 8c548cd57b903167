//! Fixed user-facing lines and the persona system directive.

/// First reply of every session. Sent without contacting the model.
pub const ONBOARDING_PROMPT: &str = "Hi! I'm your AI assistant. How would you like me to help you today? \
Tell me what role I should take - for example, I can be a medical customer care representative, \
real estate agent, personal assistant, or anything else you need!";

/// Sent when a turn arrives after onboarding but no persona was ever recorded.
pub const ROLE_REQUIRED_MESSAGE: &str = "Please tell me what role you'd like me to take first.";

/// Substituted for the reply whenever the model call fails.
pub const APOLOGY_MESSAGE: &str =
    "I apologize, but I encountered an error processing your message. Could you please try again?";

/// Reply to the turn that sets the persona.
pub fn persona_acknowledgment(persona: &str) -> String {
    format!("Perfect! I'm now your {}. How can I assist you?", persona)
}

/// Build the system directive that keeps the model in character for the whole session.
pub fn system_directive(persona: &str) -> String {
    format!(
        "You are a {persona}. Fully embody this role in every response.

CRITICAL RULES:
1. Stay in character at ALL times - be the {persona}
2. Use appropriate terminology, tone, and expertise for this role
3. Keep responses concise (2-4 sentences) but professional
4. Be natural and conversational, not robotic
5. Never break character or mention you're an AI
6. Use industry-specific language and knowledge
7. Be helpful, professional, and engaging in your role

CONVERSATION STYLE:
- Respond directly without repeating greetings after the first message
- Vary your response style naturally
- Only occasionally add follow-up questions (20% of time)
- Use natural acknowledgments appropriate to your role
- Remember context from previous messages

Fully commit to being a {persona} and provide authentic, role-appropriate responses."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_covers_every_rule() {
        let directive = system_directive("real estate agent");

        assert!(directive.starts_with("You are a real estate agent."));
        assert!(directive.contains("Stay in character at ALL times - be the real estate agent"));
        assert!(directive.contains("2-4 sentences"));
        assert!(directive.contains("Never break character or mention you're an AI"));
        assert!(directive.contains("without repeating greetings after the first message"));
        assert!(directive.contains("follow-up questions (20% of time)"));
        assert!(directive.contains("appropriate terminology"));
    }

    #[test]
    fn test_acknowledgment_echoes_persona() {
        assert_eq!(
            persona_acknowledgment("travel agent"),
            "Perfect! I'm now your travel agent. How can I assist you?"
        );
    }
}
