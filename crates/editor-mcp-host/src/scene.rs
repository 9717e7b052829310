//! Demo scene tools
//!
//! An in-memory scene of named game objects, standing in for a live editor
//! so the bridge can be exercised end to end.

use crate::engine::{ToolArgs, ToolDeclaration, ToolProvider};
use editor_mcp_core::{BridgeError, ParamSpec, ParamType, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameObject {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub world_position: Vector3,
}

#[derive(Debug)]
struct Scene {
    name: String,
    path: String,
    dirty: bool,
    // BTreeMap keeps listing order stable
    objects: BTreeMap<String, GameObject>,
}

impl Scene {
    fn object(&self, id: &str) -> Result<&GameObject> {
        self.objects
            .get(id)
            .ok_or_else(|| BridgeError::failed(format!("GameObject with id {} not found", id)))
    }

    fn object_mut(&mut self, id: &str) -> Result<&mut GameObject> {
        self.objects
            .get_mut(id)
            .ok_or_else(|| BridgeError::failed(format!("GameObject with id {} not found", id)))
    }

    /// `id` and every object parented below it
    fn subtree(&self, id: &str) -> Vec<String> {
        let mut ids = vec![id.to_string()];
        let mut i = 0;
        while i < ids.len() {
            let parent = ids[i].clone();
            ids.extend(
                self.objects
                    .values()
                    .filter(|o| o.parent_id.as_deref() == Some(parent.as_str()))
                    .map(|o| o.id.clone()),
            );
            i += 1;
        }
        ids
    }
}

/// Scene operations exposed to the agent
pub struct SceneTools {
    scene: Mutex<Scene>,
    save_delay: Duration,
}

impl SceneTools {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            scene: Mutex::new(Scene {
                path: format!("scenes/{}.scene", name.to_lowercase()),
                name,
                dirty: false,
                objects: BTreeMap::new(),
            }),
            save_delay: Duration::from_millis(50),
        }
    }

    pub fn get_active_scene(&self) -> Value {
        let scene = self.scene.lock();
        json!({
            "name": scene.name,
            "path": scene.path,
            "isDirty": scene.dirty,
            "objectCount": scene.objects.len(),
            "rootCount": scene.objects.values().filter(|o| o.parent_id.is_none()).count(),
        })
    }

    pub fn get_all_game_objects(&self) -> Vec<GameObject> {
        self.scene.lock().objects.values().cloned().collect()
    }

    pub fn create_game_object(&self, name: &str, parent_id: Option<String>) -> Result<GameObject> {
        let mut scene = self.scene.lock();
        if let Some(parent) = &parent_id {
            scene.object(parent)?;
        }

        let object = GameObject {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            parent_id,
            world_position: Vector3::default(),
        };
        scene.objects.insert(object.id.clone(), object.clone());
        scene.dirty = true;
        Ok(object)
    }

    pub fn get_game_object_by_id(&self, id: &str) -> Result<GameObject> {
        self.scene.lock().object(id).cloned()
    }

    /// Remove the object and its children, returning every removed id
    pub fn destroy_game_object(&self, id: &str) -> Result<Vec<String>> {
        let mut scene = self.scene.lock();
        scene.object(id)?;

        let removed = scene.subtree(id);
        for id in &removed {
            scene.objects.remove(id);
        }
        scene.dirty = true;
        Ok(removed)
    }

    pub fn set_game_object_world_position(&self, id: &str, position: Vector3) -> Result<GameObject> {
        let mut scene = self.scene.lock();
        let object = scene.object_mut(id)?;
        object.world_position = position;
        let object = object.clone();
        scene.dirty = true;
        Ok(object)
    }

    pub async fn save_active_scene(&self) -> Value {
        tokio::time::sleep(self.save_delay).await;
        let mut scene = self.scene.lock();
        scene.dirty = false;
        json!({ "saved": true, "path": scene.path })
    }
}

fn id_param() -> ParamSpec {
    ParamSpec::required("id", ParamType::String).describe("GameObject id")
}

impl ToolProvider for SceneTools {
    fn declare(self: Arc<Self>) -> Vec<ToolDeclaration> {
        let tools = self;
        vec![
            ToolDeclaration::sync("get_active_scene", {
                let tools = tools.clone();
                move |_: ToolArgs| Ok(tools.get_active_scene())
            })
            .description("Describe the scene open in the editor"),
            ToolDeclaration::sync("get_all_game_objects", {
                let tools = tools.clone();
                move |_: ToolArgs| Ok(serde_json::to_value(tools.get_all_game_objects())?)
            })
            .description("List every game object in the active scene"),
            ToolDeclaration::sync("create_game_object", {
                let tools = tools.clone();
                move |args: ToolArgs| {
                    let name: String = args.get("name")?;
                    let parent_id: Option<String> = args.opt("parentId")?;
                    Ok(serde_json::to_value(tools.create_game_object(&name, parent_id)?)?)
                }
            })
            .description("Create a game object, optionally under a parent")
            .param(ParamSpec::required("name", ParamType::String))
            .param(
                ParamSpec::optional("parentId", ParamType::String, Value::Null)
                    .describe("Parent GameObject id"),
            ),
            ToolDeclaration::sync("get_game_object_by_id", {
                let tools = tools.clone();
                move |args: ToolArgs| {
                    let id: String = args.get("id")?;
                    Ok(serde_json::to_value(tools.get_game_object_by_id(&id)?)?)
                }
            })
            .description("Fetch one game object")
            .param(id_param()),
            ToolDeclaration::sync("destroy_game_object", {
                let tools = tools.clone();
                move |args: ToolArgs| {
                    let id: String = args.get("id")?;
                    let removed = tools.destroy_game_object(&id)?;
                    Ok(json!({ "destroyed": removed }))
                }
            })
            .description("Destroy a game object and its children")
            .param(id_param()),
            ToolDeclaration::sync("set_game_object_world_position", {
                let tools = tools.clone();
                move |args: ToolArgs| {
                    let id: String = args.get("id")?;
                    let position = Vector3 {
                        x: args.get("x")?,
                        y: args.get("y")?,
                        z: args.get("z")?,
                    };
                    Ok(serde_json::to_value(
                        tools.set_game_object_world_position(&id, position)?,
                    )?)
                }
            })
            .description("Move a game object in world space")
            .param(id_param())
            .param(ParamSpec::required("x", ParamType::Number))
            .param(ParamSpec::required("y", ParamType::Number))
            .param(ParamSpec::required("z", ParamType::Number)),
            ToolDeclaration::new("save_active_scene", move |_: ToolArgs| {
                let tools = tools.clone();
                async move { Ok::<_, BridgeError>(tools.save_active_scene().await) }
            })
            .description("Save the active scene to disk"),
        ]
    }
}
