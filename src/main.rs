use clap::Parser;
use crossbeam_channel::Receiver;
use std::io::BufRead;
use std::time::Duration;

use roundabout::{
    available_input_ports, available_output_ports, ChannelObserver, EngineConfig, HostConfig,
    HostError, LoggingObserver, Notification, Roundabout, SequencerId, SequencerObserver,
};

#[derive(Parser, Debug)]
#[command(name = "roundabout", version, about = "MIDI step sequencer with branching rings")]
struct Args {
    /// Initial tempo
    #[arg(long, default_value_t = 120.0)]
    bpm: f64,

    #[arg(long, default_value_t = 4)]
    steps_per_beat: u32,

    /// Connect MIDI input to the first port whose name contains this
    #[arg(long)]
    midi_in: Option<String>,

    /// Connect MIDI output to the first port whose name contains this
    #[arg(long)]
    midi_out: Option<String>,

    /// Run a demo pattern without the UI
    #[arg(long)]
    headless: bool,

    /// Print MIDI ports and exit
    #[arg(long)]
    list_ports: bool,
}

impl Args {
    fn host_config(&self) -> HostConfig {
        HostConfig {
            midi_input: self.midi_in.clone(),
            midi_output: self.midi_out.clone(),
            bpm: self.bpm,
            engine: EngineConfig {
                steps_per_beat: self.steps_per_beat.max(1),
                ..EngineConfig::default()
            },
            ..HostConfig::default()
        }
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if args.list_ports {
        list_ports();
        return;
    }

    if let Err(e) = run(args) {
        log::error!("{}", e);
        eprintln!("roundabout: {}", e);
        std::process::exit(1);
    }
}

fn list_ports() {
    println!("MIDI inputs:");
    for name in available_input_ports() {
        println!("  {}", name);
    }
    println!("MIDI outputs:");
    for name in available_output_ports() {
        println!("  {}", name);
    }
}

#[cfg(feature = "gui")]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    if args.headless {
        return Ok(run_headless(&args)?);
    }
    gui::run(&args)
}

#[cfg(not(feature = "gui"))]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    if !args.headless {
        log::info!("built without the gui feature, running headless");
    }
    Ok(run_headless(&args)?)
}

/// Open a session with a logging observer plus a channel for this thread.
fn open_session(args: &Args) -> Result<(Roundabout, Receiver<Notification>), HostError> {
    let (observer, notifications) = ChannelObserver::channel();
    let observers: Vec<Box<dyn SequencerObserver>> = vec![Box::new(LoggingObserver), Box::new(observer)];
    let session = Roundabout::new(args.host_config(), observers)?;
    Ok((session, notifications))
}

fn wait_for_created(notifications: &Receiver<Notification>) -> Option<SequencerId> {
    loop {
        match notifications.recv_timeout(Duration::from_secs(2)) {
            Ok(Notification::CreatedSequencer(id)) => return Some(id),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

fn run_headless(args: &Args) -> Result<(), HostError> {
    let (session, notifications) = open_session(args)?;
    let handle = session.handle();

    handle.create_sequencer();
    handle.create_sequencer();
    let (Some(a), Some(b)) = (wait_for_created(&notifications), wait_for_created(&notifications)) else {
        log::error!("engine did not create the demo sequencers");
        return Ok(());
    };

    // a: four on the floor with a fifth on top, every other lap detours into b
    for step in [0, 4, 8, 12] {
        handle.toggle_step(a, step);
        handle.toggle_note(a, step, 0);
    }
    handle.toggle_note(a, 8, 7);
    handle.connect(a, 15, b, 8);
    handle.set_branch_frequency(a, 15, 1, 1);

    // b: a short run up the scale, then back to the top of a
    for (step, note) in [(8, 0), (9, 2), (10, 4), (11, 5), (12, 7), (13, 9), (14, 11), (15, 12)] {
        handle.toggle_step(b, step);
        handle.toggle_note(b, step, note);
    }
    handle.set_output_channel(b, 1);
    handle.connect(b, 15, a, 0);

    session.transport().start();
    println!(
        "Playing at {} bpm ({} Hz). Press Enter to stop.",
        args.bpm,
        session.sample_rate()
    );

    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);

    session.transport().stop();
    // Let the next callback release sounding notes
    std::thread::sleep(Duration::from_millis(100));
    Ok(())
}

#[cfg(feature = "gui")]
mod gui {
    use super::{open_session, Args};
    use crossbeam_channel::Receiver;
    use eframe::egui;

    use roundabout::{
        midi_note_name, NoteMask, Notification, Roundabout, SequencerId, DEFAULT_BASE_NOTE,
        MAX_CHANNEL, NOTE_COUNT, STEP_COUNT,
    };

    pub fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
        let (session, notifications) = open_session(args)?;
        let app = RoundaboutApp::new(session, notifications, args.bpm, args.steps_per_beat);

        let options = eframe::NativeOptions {
            viewport: egui::ViewportBuilder::default()
                .with_inner_size([900.0, 640.0])
                .with_title("Roundabout"),
            ..Default::default()
        };

        eframe::run_native("Roundabout", options, Box::new(|_cc| Ok(Box::new(app))))?;
        Ok(())
    }

    /// What the UI last told the engine about a step.
    #[derive(Clone, Copy, Default)]
    struct StepView {
        active: bool,
        notes: NoteMask,
        connection: Option<(SequencerId, usize)>,
        branch: u32,
        continue_frequency: u32,
        counter: u32,
    }

    struct SequencerView {
        id: SequencerId,
        steps: [StepView; STEP_COUNT],
        current: Option<usize>,
        input_channel: u8,
        output_channel: u8,
    }

    impl SequencerView {
        fn new(id: SequencerId) -> Self {
            Self {
                id,
                steps: [StepView {
                    branch: 1,
                    ..StepView::default()
                }; STEP_COUNT],
                current: None,
                input_channel: 0,
                output_channel: 0,
            }
        }
    }

    struct RoundaboutApp {
        session: Roundabout,
        notifications: Receiver<Notification>,
        sequencers: Vec<SequencerView>,
        selected: usize,
        selected_step: usize,
        playing: bool,
        bpm: f64,
        steps_per_beat: u32,

        // Connection editor
        target: usize,
        target_step: usize,
    }

    impl RoundaboutApp {
        fn new(session: Roundabout, notifications: Receiver<Notification>, bpm: f64, steps_per_beat: u32) -> Self {
            session.handle().create_sequencer();
            Self {
                session,
                notifications,
                sequencers: Vec::new(),
                selected: 0,
                selected_step: 0,
                playing: false,
                bpm,
                steps_per_beat,
                target: 0,
                target_step: 0,
            }
        }

        fn view_mut(&mut self, id: SequencerId) -> Option<&mut SequencerView> {
            self.sequencers.iter_mut().find(|s| s.id == id)
        }

        fn handle_notifications(&mut self) {
            while let Ok(notification) = self.notifications.try_recv() {
                match notification {
                    Notification::CreatedSequencer(id) => self.sequencers.push(SequencerView::new(id)),
                    Notification::RemovedSequencer(id) => {
                        self.sequencers.retain(|s| s.id != id);
                        for view in self.sequencers.iter_mut() {
                            for step in view.steps.iter_mut() {
                                if step.connection.map(|(target, _)| target) == Some(id) {
                                    step.connection = None;
                                }
                            }
                        }
                        self.selected = self.selected.min(self.sequencers.len().saturating_sub(1));
                    }
                    Notification::EnteredStep { sequencer, step } => {
                        if let Some(view) = self.view_mut(sequencer) {
                            view.current = Some(step);
                        }
                    }
                    Notification::LeftStep { sequencer, step } => {
                        if let Some(view) = self.view_mut(sequencer) {
                            if view.current == Some(step) {
                                view.current = None;
                            }
                        }
                    }
                    Notification::ChangedBranchCounter {
                        sequencer,
                        step,
                        counter,
                    } => {
                        if let Some(view) = self.view_mut(sequencer) {
                            view.steps[step].counter = counter;
                        }
                    }
                    Notification::Shutdown => {}
                }
            }
        }

        fn transport_bar(&mut self, ui: &mut egui::Ui) {
            ui.horizontal(|ui| {
                let transport = self.session.transport();
                if self.playing {
                    if ui.button("⏸ Stop").clicked() {
                        transport.stop();
                        self.playing = false;
                    }
                } else if ui.button("▶ Play").clicked() {
                    transport.start();
                    self.playing = true;
                }
                if ui.button("⏮ Rewind").clicked() {
                    transport.locate(0);
                }

                ui.add_space(20.0);
                ui.label("BPM:");
                if ui
                    .add(egui::DragValue::new(&mut self.bpm).clamp_range(20.0..=300.0).speed(0.5))
                    .changed()
                {
                    transport.set_bpm(self.bpm);
                }

                ui.label("Steps per beat:");
                if ui
                    .add(egui::DragValue::new(&mut self.steps_per_beat).clamp_range(1..=16))
                    .changed()
                {
                    self.session.handle().set_steps_per_beat(self.steps_per_beat);
                }

                ui.add_space(20.0);
                if ui.button("+ Sequencer").clicked() {
                    self.session.handle().create_sequencer();
                }
            });
        }

        fn sequencer_tabs(&mut self, ui: &mut egui::Ui) {
            let mut remove = None;
            ui.horizontal(|ui| {
                for (i, view) in self.sequencers.iter().enumerate() {
                    let label = match view.current {
                        Some(step) => format!("{} ● {}", view.id, step + 1),
                        None => view.id.to_string(),
                    };
                    if ui.selectable_label(self.selected == i, label).clicked() {
                        self.selected = i;
                    }
                }
                if let Some(view) = self.sequencers.get(self.selected) {
                    ui.add_space(20.0);
                    if ui.button("Play from here").clicked() {
                        self.session.handle().activate(view.id);
                    }
                    if self.sequencers.len() > 1 && ui.button("Remove").clicked() {
                        remove = Some(view.id);
                    }
                }
            });
            if let Some(id) = remove {
                self.session.handle().remove_sequencer(id);
            }
        }

        fn step_grid(&mut self, ui: &mut egui::Ui) {
            let handle = self.session.handle().clone();
            let Some(view) = self.sequencers.get_mut(self.selected) else {
                ui.label("Waiting for the engine...");
                return;
            };

            for row in 0..2 {
                ui.horizontal(|ui| {
                    for step in row * 8..row * 8 + 8 {
                        let state = view.steps[step];
                        let is_current = view.current == Some(step);
                        let mut text = format!("{}", step + 1);
                        if state.connection.is_some() {
                            text.push_str(" ↪");
                        }

                        let button = egui::Button::new(text)
                            .min_size(egui::vec2(60.0, 48.0))
                            .stroke(if step == self.selected_step {
                                egui::Stroke::new(2.0, egui::Color32::WHITE)
                            } else {
                                egui::Stroke::NONE
                            })
                            .fill(if is_current {
                                egui::Color32::from_rgb(100, 200, 100)
                            } else if state.active {
                                egui::Color32::from_rgb(60, 60, 200)
                            } else {
                                egui::Color32::from_rgb(40, 40, 40)
                            });

                        let response = ui.add(button);
                        if response.clicked() {
                            view.steps[step].active = !state.active;
                            handle.toggle_step(view.id, step);
                        }
                        if response.secondary_clicked() {
                            self.selected_step = step;
                        }
                    }
                });
            }
            ui.label("Click to toggle a step, right-click to edit it");
        }

        fn step_editor(&mut self, ui: &mut egui::Ui) {
            let handle = self.session.handle().clone();
            let targets: Vec<SequencerId> = self.sequencers.iter().map(|s| s.id).collect();
            let step = self.selected_step;
            let Some(view) = self.sequencers.get_mut(self.selected) else {
                return;
            };
            let id = view.id;

            ui.heading(format!("Step {}", step + 1));

            ui.horizontal(|ui| {
                for note in 0..NOTE_COUNT {
                    let on = view.steps[step].notes.contains(note);
                    let name = midi_note_name(DEFAULT_BASE_NOTE + note as u8);
                    if ui.selectable_label(on, name).clicked() {
                        view.steps[step].notes.toggle(note);
                        handle.toggle_note(id, step, note);
                    }
                }
            });

            ui.add_space(8.0);
            ui.horizontal(|ui| {
                ui.label("Branch to:");
                self.target = self.target.min(targets.len().saturating_sub(1));
                egui::ComboBox::from_id_source("branch_target")
                    .selected_text(targets.get(self.target).map(|t| t.to_string()).unwrap_or_default())
                    .show_ui(ui, |ui| {
                        for (i, target) in targets.iter().enumerate() {
                            ui.selectable_value(&mut self.target, i, target.to_string());
                        }
                    });
                ui.label("step");
                let mut shown = self.target_step + 1;
                if ui
                    .add(egui::DragValue::new(&mut shown).clamp_range(1..=STEP_COUNT))
                    .changed()
                {
                    self.target_step = shown - 1;
                }

                if let Some(&target) = targets.get(self.target) {
                    if ui.button("Connect").clicked() {
                        view.steps[step].connection = Some((target, self.target_step));
                        view.steps[step].counter = 0;
                        handle.connect(id, step, target, self.target_step);
                    }
                }
                if view.steps[step].connection.is_some() && ui.button("Disconnect").clicked() {
                    view.steps[step].connection = None;
                    view.steps[step].counter = 0;
                    handle.disconnect(id, step);
                }
            });

            let state = &mut view.steps[step];
            if let Some((target, target_step)) = state.connection {
                ui.label(format!("Connected to {} step {}", target, target_step + 1));
            }

            ui.horizontal(|ui| {
                ui.label("Branch");
                let branch = ui.add(egui::DragValue::new(&mut state.branch).clamp_range(0..=64));
                ui.label("times, then continue");
                let cont = ui.add(egui::DragValue::new(&mut state.continue_frequency).clamp_range(0..=64));
                ui.label("times");
                if branch.changed() || cont.changed() {
                    state.counter = 0;
                    handle.set_branch_frequency(id, step, state.branch, state.continue_frequency);
                }
                ui.label(format!("(counter {})", state.counter));
            });

            ui.add_space(8.0);
            ui.horizontal(|ui| {
                ui.label("MIDI in channel:");
                let mut input = view.input_channel + 1;
                if ui
                    .add(egui::DragValue::new(&mut input).clamp_range(1..=MAX_CHANNEL + 1))
                    .changed()
                {
                    view.input_channel = input - 1;
                    handle.set_input_channel(id, view.input_channel);
                }
                ui.label("MIDI out channel:");
                let mut output = view.output_channel + 1;
                if ui
                    .add(egui::DragValue::new(&mut output).clamp_range(1..=MAX_CHANNEL + 1))
                    .changed()
                {
                    view.output_channel = output - 1;
                    handle.set_output_channel(id, view.output_channel);
                }
            });
        }
    }

    impl eframe::App for RoundaboutApp {
        fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
            ctx.request_repaint();
            self.handle_notifications();

            egui::CentralPanel::default().show(ctx, |ui| {
                ui.heading("Roundabout");
                ui.add_space(10.0);
                self.transport_bar(ui);
                ui.add_space(10.0);
                self.sequencer_tabs(ui);
                ui.separator();
                self.step_grid(ui);
                ui.separator();
                self.step_editor(ui);
            });
        }
    }
}
