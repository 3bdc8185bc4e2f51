mod config;
mod replay;
mod telemetry;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use graphpipe_session::{
    ChannelLayout, DetectionTask, HolisticLayout, HolisticPart, HolisticTask, MultiLandmarkTask,
    Primary, ScoreTask, SingleLandmarkTask, TaskVariant,
};

use crate::config::{ReplayCliArgs, ReplayConfig, TaskPreset};

#[derive(Debug, Parser)]
#[command(name = "graphpipe", version, about = "Drive graph sessions from the command line")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Feed frames through a graph and print each output as a JSON line.
    Replay(ReplayCliArgs),
    /// List task presets and the streams they bind.
    Tasks,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    match Cli::parse().command {
        Command::Replay(args) => {
            let config = ReplayConfig::try_from(args)?;
            let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
            let metrics = if config.telemetry.print_metrics {
                telemetry::init_metrics_recorder()
            } else {
                None
            };

            let summary = replay::run(&config)?;
            eprintln!(
                "fed {} frame(s), wrote {} line(s), {} runtime error(s)",
                summary.frames_fed, summary.lines_written, summary.runtime_errors
            );
            if let Some(handle) = metrics {
                eprintln!("{}", handle.render());
            }
            Ok(())
        }
        Command::Tasks => {
            for preset in TaskPreset::value_variants() {
                println!("{}", describe(*preset));
            }
            Ok(())
        }
    }
}

fn describe(preset: TaskPreset) -> String {
    let (kind, streams) = match preset {
        TaskPreset::FaceDetection => {
            primary_streams::<DetectionTask>(&ChannelLayout::face_detection())
        }
        TaskPreset::FaceMesh => primary_streams::<MultiLandmarkTask>(&ChannelLayout::face_mesh()),
        TaskPreset::HandTracking => {
            primary_streams::<MultiLandmarkTask>(&ChannelLayout::hand_tracking())
        }
        TaskPreset::PoseTracking => {
            primary_streams::<SingleLandmarkTask>(&ChannelLayout::pose_tracking())
        }
        TaskPreset::Holistic => {
            let layout = HolisticLayout::default();
            let streams = HolisticPart::ALL
                .iter()
                .map(|part| format!("{}={}", part.label(), layout.stream(*part)))
                .collect();
            (HolisticTask::KIND, streams)
        }
        TaskPreset::FaceBlendshapes => {
            primary_streams::<ScoreTask>(&ChannelLayout::face_blendshapes())
        }
    };
    format!("{:<18} {:<17} {}", preset.name(), kind, streams.join(" "))
}

fn primary_streams<V>(layout: &ChannelLayout) -> (graphpipe_session::TaskKind, Vec<String>)
where
    V: TaskVariant<Slot = Primary, Layout = ChannelLayout>,
{
    let streams = V::streams(layout, Primary);
    let mut names = vec![format!("output={}", streams.output)];
    if let Some(presence) = streams.presence {
        names.push(format!("presence={presence}"));
    }
    (V::KIND, names)
}
