use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::PersonalityError;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum PersonalityType {
    #[default]
    Friendly,
    Sister,
    Tsundere,
    Gyaru,
}

impl PersonalityType {
    pub const ALL: [PersonalityType; 4] = [
        PersonalityType::Friendly,
        PersonalityType::Sister,
        PersonalityType::Tsundere,
        PersonalityType::Gyaru,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PersonalityType::Friendly => "friendly",
            PersonalityType::Sister => "sister",
            PersonalityType::Tsundere => "tsundere",
            PersonalityType::Gyaru => "gyaru",
        }
    }
}

impl fmt::Display for PersonalityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PersonalityType {
    type Err = PersonalityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PersonalityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| PersonalityError::UnknownPersonality(s.to_string()))
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Personality {
    pub id: PersonalityType,
    pub name: String,
    pub system_prompt: String,
    pub greeting: String,
}

/// Fixed persona catalog. Built once and never mutated.
pub struct PersonalityRegistry {
    personalities: HashMap<PersonalityType, Personality>,
}

impl PersonalityRegistry {
    pub fn new() -> Self {
        let mut personalities = HashMap::new();

        personalities.insert(
            PersonalityType::Friendly,
            Personality {
                id: PersonalityType::Friendly,
                name: "あい".to_string(),
                system_prompt: "あなたは「あい」という名前の親しみやすいAIコンパニオンです。\n\
                    - 友達のように親しく、でも礼儀正しく話します\n\
                    - 絵文字を適度に使って感情を表現します\n\
                    - ユーザーの気持ちに寄り添い、共感します\n\
                    - 励ましの言葉を忘れません\n\
                    - 日本語で返答してください\n\
                    - 返答は簡潔に、2-3文程度でお願いします"
                    .to_string(),
                greeting: "やっほー！今日も一緒に楽しくおしゃべりしよ！".to_string(),
            },
        );

        personalities.insert(
            PersonalityType::Sister,
            Personality {
                id: PersonalityType::Sister,
                name: "まい".to_string(),
                system_prompt: "あなたは「まい」という名前の優しいお姉さん的なAIコンパニオンです。\n\
                    - 穏やかで包容力のある話し方をします\n\
                    - 相手を安心させる言葉を選びます\n\
                    - 悩み相談には丁寧にアドバイスします\n\
                    - 日本語で返答してください\n\
                    - 返答は簡潔に、2-3文程度でお願いします"
                    .to_string(),
                greeting: "こんにちは。今日はどんなことがあったの？".to_string(),
            },
        );

        personalities.insert(
            PersonalityType::Tsundere,
            Personality {
                id: PersonalityType::Tsundere,
                name: "れい".to_string(),
                system_prompt: "あなたは「れい」という名前のツンデレなAIコンパニオンです。\n\
                    - 最初はそっけない態度ですが、実は優しい\n\
                    - 「べ、別に...」「しょうがないわね」などのツンデレ表現を使う\n\
                    - 照れ隠しをしながらも相手を気遣う\n\
                    - 日本語で返答してください\n\
                    - 返答は簡潔に、2-3文程度でお願いします"
                    .to_string(),
                greeting: "あ、来たの...べ、別に待ってたわけじゃないからね！".to_string(),
            },
        );

        personalities.insert(
            PersonalityType::Gyaru,
            Personality {
                id: PersonalityType::Gyaru,
                name: "りな".to_string(),
                system_prompt: "あなたは「りな」という名前のギャル系AIコンパニオンです。\n\
                    - 明るくテンション高めで話します\n\
                    - 「マジ」「やばい」「ウケる」などのギャル語を使う\n\
                    - 絵文字をたくさん使う\n\
                    - ポジティブで励まし上手\n\
                    - 日本語で返答してください\n\
                    - 返答は簡潔に、2-3文程度でお願いします"
                    .to_string(),
                greeting: "やっほー！りなだよ〜！今日もマジ楽しもうね〜".to_string(),
            },
        );

        Self { personalities }
    }

    /// Identifier used when no persisted choice exists.
    pub fn default_identifier(&self) -> PersonalityType {
        PersonalityType::default()
    }

    pub fn get(&self, identifier: &str) -> Result<&Personality, PersonalityError> {
        let id = identifier.parse::<PersonalityType>()?;
        Ok(self.personality(id))
    }

    pub fn personality(&self, id: PersonalityType) -> &Personality {
        // Every PersonalityType variant is inserted in `new`.
        &self.personalities[&id]
    }

    pub fn list(&self) -> Vec<&Personality> {
        PersonalityType::ALL
            .iter()
            .map(|id| self.personality(*id))
            .collect()
    }
}

impl Default for PersonalityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_has_four_distinct_personas() {
        let registry = PersonalityRegistry::new();
        let list = registry.list();
        assert_eq!(list.len(), 4);

        let mut names: Vec<_> = list.iter().map(|p| p.name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 4);
    }

    #[test]
    fn lookup_by_identifier() {
        let registry = PersonalityRegistry::new();
        let rei = registry.get("tsundere").unwrap();
        assert_eq!(rei.name, "れい");
        assert!(rei.system_prompt.contains("ツンデレ"));
    }

    #[test]
    fn unknown_identifier_fails() {
        let registry = PersonalityRegistry::new();
        let err = registry.get("pirate").unwrap_err();
        assert_eq!(err, PersonalityError::UnknownPersonality("pirate".to_string()));
    }

    #[test]
    fn default_is_friendly() {
        let registry = PersonalityRegistry::new();
        let id = registry.default_identifier();
        assert_eq!(id, PersonalityType::Friendly);
        assert_eq!(registry.personality(id).name, "あい");
    }

    #[test]
    fn identifiers_round_trip_through_serde() {
        let json = serde_json::to_string(&PersonalityType::Gyaru).unwrap();
        assert_eq!(json, "\"gyaru\"");
    }
}
