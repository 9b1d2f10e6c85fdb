use serenity::{
    all::ButtonStyle,
    builder::{CreateActionRow, CreateButton},
};

/// IDs personalizados para los botones
pub mod button_ids {
    pub const STOP: &str = "stop";
    pub const PAUSE: &str = "pause";
    pub const RESUME: &str = "resume";
    pub const SKIP: &str = "skip";
    pub const LOOP: &str = "loop";
    pub const SHUFFLE: &str = "shuffle";
}

/// Acción de control, venga de un botón o de un comando slash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Stop,
    Pause,
    Resume,
    Skip,
    Loop,
    Shuffle,
}

impl ControlAction {
    /// Sirve tanto para `custom_id` de botones como para nombres de comandos
    pub fn from_custom_id(id: &str) -> Option<Self> {
        match id {
            button_ids::STOP => Some(Self::Stop),
            button_ids::PAUSE => Some(Self::Pause),
            button_ids::RESUME => Some(Self::Resume),
            button_ids::SKIP => Some(Self::Skip),
            button_ids::LOOP => Some(Self::Loop),
            button_ids::SHUFFLE => Some(Self::Shuffle),
            _ => None,
        }
    }

    pub fn custom_id(self) -> &'static str {
        match self {
            Self::Stop => button_ids::STOP,
            Self::Pause => button_ids::PAUSE,
            Self::Resume => button_ids::RESUME,
            Self::Skip => button_ids::SKIP,
            Self::Loop => button_ids::LOOP,
            Self::Shuffle => button_ids::SHUFFLE,
        }
    }
}

/// Controles del mensaje de estado: pausa o reanudar según el estado actual
pub fn create_player_controls(is_paused: bool, loop_enabled: bool) -> Vec<CreateActionRow> {
    let stop_btn = CreateButton::new(button_ids::STOP)
        .emoji('⏹')
        .label("Detener")
        .style(ButtonStyle::Danger);

    let pause_resume_btn = if is_paused {
        CreateButton::new(button_ids::RESUME)
            .emoji('▶')
            .label("Reanudar")
            .style(ButtonStyle::Primary)
    } else {
        CreateButton::new(button_ids::PAUSE)
            .emoji('⏸')
            .label("Pausar")
            .style(ButtonStyle::Primary)
    };

    let skip_btn = CreateButton::new(button_ids::SKIP)
        .emoji('⏭')
        .label("Saltar")
        .style(ButtonStyle::Success);

    let loop_btn = CreateButton::new(button_ids::LOOP)
        .emoji('🔁')
        .style(if loop_enabled {
            ButtonStyle::Success
        } else {
            ButtonStyle::Secondary
        });

    let shuffle_btn = CreateButton::new(button_ids::SHUFFLE)
        .emoji('🔀')
        .style(ButtonStyle::Secondary);

    vec![CreateActionRow::Buttons(vec![
        stop_btn,
        pause_resume_btn,
        skip_btn,
        loop_btn,
        shuffle_btn,
    ])]
}
