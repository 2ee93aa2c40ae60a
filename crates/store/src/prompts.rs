//! Prompt store with atomic activation swap.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use vox_domain::error::{Error, Result};
use vox_domain::prompt::Prompt;

pub struct PromptStore {
    path: PathBuf,
    prompts: RwLock<HashMap<Uuid, Prompt>>,
}

/// Fields accepted when creating or updating a prompt.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PromptInput {
    pub name: String,
    pub system_text: String,
    pub voice_id: String,
    pub model: String,
    #[serde(default = "d_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub greeting: Option<String>,
}

fn d_temperature() -> f32 {
    0.7
}

impl PromptStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path).map_err(Error::Io)?;
        let path = state_path.join("prompts.json");
        let prompts = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            prompts: RwLock::new(prompts),
        })
    }

    pub fn create(&self, input: PromptInput) -> Result<Prompt> {
        let now = Utc::now();
        let prompt = Prompt {
            id: Uuid::new_v4(),
            name: input.name,
            system_text: input.system_text,
            voice_id: input.voice_id,
            model: input.model,
            temperature: input.temperature,
            greeting: input.greeting,
            greeting_duration_ms: None,
            active: false,
            created_at: now,
            updated_at: now,
        };
        let mut prompts = self.prompts.write();
        // The first prompt ever created becomes active automatically.
        let mut prompt = prompt;
        if prompts.is_empty() {
            prompt.active = true;
        }
        prompts.insert(prompt.id, prompt.clone());
        drop(prompts);
        self.flush()?;
        Ok(prompt)
    }

    pub fn update(&self, id: &Uuid, input: PromptInput) -> Result<Prompt> {
        let mut prompts = self.prompts.write();
        let prompt = prompts
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("prompt {id}")))?;
        prompt.name = input.name;
        prompt.system_text = input.system_text;
        prompt.voice_id = input.voice_id;
        prompt.model = input.model;
        prompt.temperature = input.temperature;
        if prompt.greeting != input.greeting {
            prompt.greeting = input.greeting;
            // A new greeting invalidates the measured duration.
            prompt.greeting_duration_ms = None;
        }
        prompt.updated_at = Utc::now();
        let updated = prompt.clone();
        drop(prompts);
        self.flush()?;
        Ok(updated)
    }

    /// Atomic swap: exactly one prompt is active afterwards.
    pub fn activate(&self, id: &Uuid) -> Result<Prompt> {
        let mut prompts = self.prompts.write();
        if !prompts.contains_key(id) {
            return Err(Error::NotFound(format!("prompt {id}")));
        }
        for p in prompts.values_mut() {
            p.active = p.id == *id;
        }
        let activated = prompts[id].clone();
        drop(prompts);
        self.flush()?;
        Ok(activated)
    }

    pub fn set_greeting_duration(&self, id: &Uuid, duration_ms: u64) {
        let mut prompts = self.prompts.write();
        if let Some(p) = prompts.get_mut(id) {
            p.greeting_duration_ms = Some(duration_ms);
        }
        drop(prompts);
        let _ = self.flush();
    }

    pub fn delete(&self, id: &Uuid) -> Result<()> {
        let mut prompts = self.prompts.write();
        match prompts.get(id) {
            None => return Err(Error::NotFound(format!("prompt {id}"))),
            Some(p) if p.active => {
                return Err(Error::Conflict("cannot delete the active prompt".into()))
            }
            Some(_) => {
                prompts.remove(id);
            }
        }
        drop(prompts);
        self.flush()
    }

    pub fn get(&self, id: &Uuid) -> Option<Prompt> {
        self.prompts.read().get(id).cloned()
    }

    pub fn active(&self) -> Option<Prompt> {
        self.prompts.read().values().find(|p| p.active).cloned()
    }

    pub fn list(&self) -> Vec<Prompt> {
        let mut all: Vec<Prompt> = self.prompts.read().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    fn flush(&self) -> Result<()> {
        let prompts = self.prompts.read();
        let json = serde_json::to_string_pretty(&*prompts)?;
        std::fs::write(&self.path, json).map_err(Error::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(name: &str) -> PromptInput {
        PromptInput {
            name: name.into(),
            system_text: "atenda com simpatia".into(),
            voice_id: "luna".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.7,
            greeting: Some("Olá!".into()),
        }
    }

    #[test]
    fn first_prompt_becomes_active() {
        let dir = tempfile::tempdir().unwrap();
        let store = PromptStore::new(dir.path()).unwrap();
        let p = store.create(input("default")).unwrap();
        assert!(p.active);
        assert_eq!(store.active().unwrap().id, p.id);
    }

    #[test]
    fn activation_is_an_atomic_swap() {
        let dir = tempfile::tempdir().unwrap();
        let store = PromptStore::new(dir.path()).unwrap();
        let a = store.create(input("a")).unwrap();
        let b = store.create(input("b")).unwrap();

        store.activate(&b.id).unwrap();
        assert_eq!(store.active().unwrap().id, b.id);
        assert!(!store.get(&a.id).unwrap().active);

        let actives = store.list().iter().filter(|p| p.active).count();
        assert_eq!(actives, 1);
    }

    #[test]
    fn deleting_active_prompt_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = PromptStore::new(dir.path()).unwrap();
        let a = store.create(input("a")).unwrap();
        let err = store.delete(&a.id);
        assert!(matches!(err, Err(Error::Conflict(_))));
    }

    #[test]
    fn changing_greeting_clears_measured_duration() {
        let dir = tempfile::tempdir().unwrap();
        let store = PromptStore::new(dir.path()).unwrap();
        let p = store.create(input("a")).unwrap();
        store.set_greeting_duration(&p.id, 1_800);
        assert_eq!(store.get(&p.id).unwrap().greeting_duration_ms, Some(1_800));

        let mut changed = input("a");
        changed.greeting = Some("Bom dia!".into());
        store.update(&p.id, changed).unwrap();
        assert_eq!(store.get(&p.id).unwrap().greeting_duration_ms, None);
    }

    #[test]
    fn survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = PromptStore::new(dir.path()).unwrap();
            store.create(input("kept")).unwrap().id
        };
        let store = PromptStore::new(dir.path()).unwrap();
        assert_eq!(store.get(&id).unwrap().name, "kept");
    }
}
