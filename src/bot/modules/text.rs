use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serenity::{
    all::{CommandInteraction, Context},
    builder::EditInteractionResponse,
};
use std::{sync::Arc, time::Instant};

use super::{respond_text, string_option};
use crate::{
    app::AppContext,
    platform::{CommandDescriptor, OptionKind},
    reloader::{CommandModule, ModuleManifest},
};

pub struct TextModule {
    default_greeting: String,
}

pub fn factory(manifest: &ModuleManifest) -> Arc<dyn CommandModule> {
    Arc::new(TextModule {
        default_greeting: manifest
            .setting("default_greeting")
            .unwrap_or_else(|| "Hola".to_string()),
    })
}

impl TextModule {
    fn greeting(&self, name: &str, greeting_type: Option<&str>) -> String {
        let greeting = greeting_type.unwrap_or(&self.default_greeting);
        format!("{}, {}! Un horror conocerte.", greeting, name)
    }
}

#[async_trait]
impl CommandModule for TextModule {
    fn name(&self) -> &str {
        "text"
    }

    fn commands(&self) -> Vec<CommandDescriptor> {
        vec![
            CommandDescriptor::new("ping", "Mide la latencia del bot"),
            CommandDescriptor::new("greet", "Un saludo \"amistoso\"")
                .option(OptionKind::String, "name", "¿A quién saludar?", true)
                .option(OptionKind::String, "greeting_type", "Cómo empezar el saludo", false),
        ]
    }

    async fn handle(&self, ctx: &Context, command: &CommandInteraction, _app: &AppContext) -> Result<()> {
        match command.data.name.as_str() {
            "ping" => {
                let started = Instant::now();
                respond_text(ctx, command, "🏓 Pong…").await?;
                let latency = started.elapsed();
                command
                    .edit_response(
                        &ctx.http,
                        EditInteractionResponse::new().content(format!(
                            "# P O N G\n**`Latencia: {}ms`**",
                            latency.as_millis()
                        )),
                    )
                    .await?;
                Ok(())
            }
            "greet" => {
                let name = string_option(command, "name").context("Falta el nombre")?;
                let greeting = self.greeting(name, string_option(command, "greeting_type"));
                respond_text(ctx, command, greeting).await
            }
            other => anyhow::bail!("comando desconocido: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_uses_manifest_default() {
        let manifest: ModuleManifest =
            serde_json::from_str(r#"{"settings": {"default_greeting": "Buenas"}}"#).unwrap();
        let module = TextModule {
            default_greeting: manifest.setting("default_greeting").unwrap(),
        };

        assert_eq!(module.greeting("Ana", None), "Buenas, Ana! Un horror conocerte.");
        assert_eq!(module.greeting("Ana", Some("Hey")), "Hey, Ana! Un horror conocerte.");
    }
}
