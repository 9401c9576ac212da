use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{
    recipient::{Recipient, RecipientToken},
    validation::is_valid_fcm_token,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenPolicy {
    /// Cost mode: at most one device per user.
    OnePerUser,
    /// Every distinct valid device.
    AllDevices,
}

#[derive(Debug, Clone, Default)]
pub struct TokenSelection {
    pub tokens: Vec<RecipientToken>,
    pub users_selected: usize,
    pub users_without_valid_token: usize,
    pub rejected_tokens: usize,
    pub duplicate_tokens: usize,
}

impl TokenSelection {
    pub fn token_strings(&self) -> Vec<String> {
        self.tokens.iter().map(|t| t.token.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

pub struct TokenSelector {
    policy: TokenPolicy,
}

impl TokenSelector {
    pub fn new(policy: TokenPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> TokenPolicy {
        self.policy
    }

    /// Picks tokens across `recipients`, never selecting the same token twice.
    ///
    /// Under [`TokenPolicy::OnePerUser`] a user gets their first valid token
    /// not already taken by someone else.
    pub fn select<'a>(&self, recipients: impl IntoIterator<Item = &'a Recipient>) -> TokenSelection {
        let mut selection = TokenSelection::default();
        let mut seen: HashSet<&str> = HashSet::new();

        for recipient in recipients {
            let (valid, invalid): (Vec<&String>, Vec<&String>) = recipient
                .tokens
                .iter()
                .partition(|token| is_valid_fcm_token(token));
            selection.rejected_tokens += invalid.len();

            let mut picked = 0;
            for token in valid {
                if !seen.insert(token.as_str()) {
                    selection.duplicate_tokens += 1;
                    continue;
                }

                selection.tokens.push(recipient.token(token));
                picked += 1;

                if self.policy == TokenPolicy::OnePerUser {
                    break;
                }
            }

            if picked == 0 {
                selection.users_without_valid_token += 1;
            } else {
                selection.users_selected += 1;
            }
        }

        debug!(
            policy = ?self.policy,
            tokens = selection.tokens.len(),
            users = selection.users_selected,
            without_valid_token = selection.users_without_valid_token,
            rejected = selection.rejected_tokens,
            "Tokens selected"
        );

        selection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid(tag: &str) -> String {
        let mut token = format!("{tag}:APA91b");
        while token.len() < 140 {
            token.push('k');
        }
        token
    }

    fn recipient(user_id: &str, tokens: Vec<String>) -> Recipient {
        Recipient {
            user_id: user_id.to_string(),
            tokens,
            is_active: true,
            location: None,
            platform: None,
        }
    }

    #[test]
    fn test_one_per_user_takes_first_valid_token() {
        let users = vec![recipient("u1", vec!["short:x".to_string(), valid("a"), valid("b")])];
        let selection = TokenSelector::new(TokenPolicy::OnePerUser).select(&users);

        assert_eq!(selection.token_strings(), vec![valid("a")]);
        assert_eq!(selection.rejected_tokens, 1);
        assert_eq!(selection.users_selected, 1);
    }

    #[test]
    fn test_all_devices_keeps_every_valid_token() {
        let users = vec![recipient("u1", vec![valid("a"), valid("b")])];
        let selection = TokenSelector::new(TokenPolicy::AllDevices).select(&users);

        assert_eq!(selection.tokens.len(), 2);
        assert!(selection.tokens.iter().all(|t| t.user_id == "u1"));
    }

    #[test]
    fn test_user_without_valid_token_is_counted() {
        let users = vec![
            recipient("u1", vec!["bad token".to_string()]),
            recipient("u2", vec![]),
            recipient("u3", vec![valid("c")]),
        ];
        let selection = TokenSelector::new(TokenPolicy::OnePerUser).select(&users);

        assert_eq!(selection.users_without_valid_token, 2);
        assert_eq!(selection.token_strings(), vec![valid("c")]);
    }

    #[test]
    fn test_shared_token_is_sent_once() {
        let users = vec![
            recipient("u1", vec![valid("shared")]),
            recipient("u2", vec![valid("shared"), valid("own")]),
        ];
        let selection = TokenSelector::new(TokenPolicy::OnePerUser).select(&users);

        assert_eq!(selection.token_strings(), vec![valid("shared"), valid("own")]);
        assert_eq!(selection.duplicate_tokens, 1);
    }
}
