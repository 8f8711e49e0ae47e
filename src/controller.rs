//! The peck scheduler.
//!
//! A controller owns a [`Reactor`] and drives the configured birds through a
//! randomized cycle: wait a random time, then peck a random number of times,
//! then wait again. Waits and peck counts are drawn uniformly from the
//! half-open ranges `[min, max)`; the historical configuration formats
//! disagreed on whether the maximum was inclusive, and the half-open reading
//! is the documented convention here. An empty range collapses to `min`.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use rand::Rng;
use tracing::{error, info, warn};

use crate::config::{BirdSpec, Config, OutputKind, Settings};
use crate::output::Output;
use crate::reactor::{EventId, Reactor};

const WAIT_TIMER_ID: EventId = 1;
const PECK_TIMER_ID: EventId = 2;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("output {0:?} already exists")]
    DuplicateOutput(String),
    #[error("bird {bird:?} references unknown output {output:?}")]
    UnknownOutput { bird: String, output: String },
    #[error("failed to set up output {0:?}")]
    OutputSetUp(String, #[source] std::io::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    Startup,
    Waiting,
    Pecking,
}

impl State {
    fn as_str(self) -> &'static str {
        match self {
            State::Initial => "Initial",
            State::Startup => "Startup",
            State::Waiting => "Waiting",
            State::Pecking => "Pecking",
        }
    }
}

/// A bird resolved against the output table.
struct Bird {
    name: String,
    statics: Vec<usize>,
    backs: Vec<usize>,
    forwards: Vec<usize>,
}

struct Shared {
    settings: Settings,
    outputs: Vec<Output>,
    birds: Vec<Bird>,
    state: State,
    pecks_remaining: u32,
    forward: bool,
}

impl Shared {
    fn change_state(&mut self, new_state: State) {
        info!(
            "changing state from {} to {}",
            self.state.as_str(),
            new_state.as_str()
        );
        self.state = new_state;
    }

    /// Moves every bird to the forward or back position.
    fn set_positions(&mut self, forward: bool) {
        let Shared { outputs, birds, .. } = self;
        for bird in birds.iter() {
            for &index in &bird.forwards {
                outputs[index].set_value(forward);
            }
            for &index in &bird.backs {
                outputs[index].set_value(!forward);
            }
        }
    }

    fn find_output(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|output| output.name() == name)
    }
}

pub struct Controller {
    shared: Rc<RefCell<Shared>>,
    reactor: Reactor,
}

impl Controller {
    pub fn new(settings: Settings) -> Result<Self, ControllerError> {
        Ok(Self {
            shared: Rc::new(RefCell::new(Shared {
                settings,
                outputs: Vec::new(),
                birds: Vec::new(),
                state: State::Initial,
                pecks_remaining: 0,
                forward: false,
            })),
            reactor: Reactor::new()?,
        })
    }

    /// Builds a controller with every output and bird from a parsed
    /// configuration.
    pub fn from_config(config: &Config) -> Result<Self, ControllerError> {
        let mut controller = Self::new(config.settings)?;
        for spec in &config.outputs {
            match &spec.kind {
                OutputKind::Memory => controller.add_memory_output(&spec.name)?,
                OutputKind::File { path } => controller.add_file_output(&spec.name, path.clone())?,
                OutputKind::Gpio { pin } => controller.add_gpio_output(&spec.name, *pin)?,
            }
        }
        for bird in &config.birds {
            controller.add_bird(bird)?;
        }
        Ok(controller)
    }

    pub fn add_memory_output(&mut self, name: &str) -> Result<(), ControllerError> {
        self.add_output(Output::memory(name))
    }

    pub fn add_file_output(
        &mut self,
        name: &str,
        path: impl Into<PathBuf>,
    ) -> Result<(), ControllerError> {
        self.add_output(Output::file(name, path))
    }

    pub fn add_gpio_output(&mut self, name: &str, pin: u32) -> Result<(), ControllerError> {
        self.add_output(Output::gpio(name, pin))
    }

    fn add_output(&mut self, output: Output) -> Result<(), ControllerError> {
        let mut shared = self.shared.borrow_mut();
        if shared.find_output(output.name()).is_some() {
            return Err(ControllerError::DuplicateOutput(output.name().to_string()));
        }
        shared.outputs.push(output);
        Ok(())
    }

    /// Registers a bird, resolving its output names against the outputs
    /// added so far.
    pub fn add_bird(&mut self, spec: &BirdSpec) -> Result<(), ControllerError> {
        let mut shared = self.shared.borrow_mut();
        let resolve = |names: &[String]| -> Result<Vec<usize>, ControllerError> {
            names
                .iter()
                .map(|name| {
                    shared
                        .find_output(name)
                        .ok_or_else(|| ControllerError::UnknownOutput {
                            bird: spec.name.clone(),
                            output: name.clone(),
                        })
                })
                .collect()
        };
        let bird = Bird {
            name: spec.name.clone(),
            statics: resolve(&spec.statics)?,
            backs: resolve(&spec.backs)?,
            forwards: resolve(&spec.forwards)?,
        };
        info!("adding bird {}", bird.name);
        shared.birds.push(bird);
        Ok(())
    }

    /// Sets up every output and puts the birds in their resting pose:
    /// statics on, backs on, forwards off.
    pub fn set_up(&mut self) -> Result<(), ControllerError> {
        let mut shared = self.shared.borrow_mut();
        for output in &mut shared.outputs {
            output
                .set_up()
                .map_err(|err| ControllerError::OutputSetUp(output.name().to_string(), err))?;
        }

        let Shared { outputs, birds, .. } = &mut *shared;
        for bird in birds.iter() {
            for &index in &bird.statics {
                outputs[index].set_value(true);
            }
        }
        shared.set_positions(false);
        Ok(())
    }

    pub fn tear_down(&mut self) {
        let mut shared = self.shared.borrow_mut();
        for output in &mut shared.outputs {
            output.tear_down();
        }
    }

    /// Runs the schedule until [`stop`](Self::stop) is called.
    pub fn run(&mut self) -> Result<(), ControllerError> {
        if self.shared.borrow().birds.is_empty() {
            warn!("running with no birds configured");
        }
        self.shared.borrow_mut().change_state(State::Startup);
        Self::schedule_wait(&self.shared, &mut self.reactor);
        self.reactor.run()?;
        Ok(())
    }

    pub fn stop(&self) {
        self.reactor.stop();
    }

    /// The embedded reactor, for wiring extra sources next to the schedule.
    pub fn reactor_mut(&mut self) -> &mut Reactor {
        &mut self.reactor
    }

    /// Current value of a named output, if it exists.
    pub fn output_value(&self, name: &str) -> Option<bool> {
        let shared = self.shared.borrow();
        shared.find_output(name).map(|index| shared.outputs[index].value())
    }

    fn schedule_wait(shared: &Rc<RefCell<Shared>>, reactor: &mut Reactor) {
        let wait = {
            let mut state = shared.borrow_mut();
            state.change_state(State::Waiting);
            let settings = state.settings;
            pick_in_range(settings.min_wait, settings.max_wait)
        };
        let handle = Rc::clone(shared);
        if let Err(err) = reactor.add_timer(
            WAIT_TIMER_ID,
            Duration::from_millis(u64::from(wait)),
            move |reactor, id| {
                reactor.remove_timer(id);
                Self::start_pecking(&handle, reactor);
            },
        ) {
            error!("failed to schedule the next peck sequence: {err}");
        }
    }

    fn start_pecking(shared: &Rc<RefCell<Shared>>, reactor: &mut Reactor) {
        let (pecks, peck_wait) = {
            let mut state = shared.borrow_mut();
            let settings = state.settings;
            let pecks = pick_in_range(settings.min_pecks, settings.max_pecks);
            state.change_state(State::Pecking);
            state.pecks_remaining = pecks;
            state.forward = false;
            (pecks, settings.peck_wait)
        };

        if pecks == 0 {
            Self::schedule_wait(shared, reactor);
            return;
        }

        let handle = Rc::clone(shared);
        if let Err(err) = reactor.add_timer(
            PECK_TIMER_ID,
            Duration::from_millis(u64::from(peck_wait)),
            move |reactor, id| {
                Self::peck_step(&handle, reactor, id);
            },
        ) {
            error!("failed to start a peck sequence: {err}");
        }
    }

    /// One half of a peck: out on the odd steps, back on the even ones. A
    /// full peck has completed once the birds are back again.
    fn peck_step(shared: &Rc<RefCell<Shared>>, reactor: &mut Reactor, timer_id: EventId) {
        let sequence_done = {
            let mut state = shared.borrow_mut();
            let forward = !state.forward;
            state.forward = forward;
            state.set_positions(forward);
            if forward {
                false
            } else {
                state.pecks_remaining = state.pecks_remaining.saturating_sub(1);
                state.pecks_remaining == 0
            }
        };

        if sequence_done {
            reactor.remove_timer(timer_id);
            Self::schedule_wait(shared, reactor);
        }
    }
}

/// Uniform draw from the half-open range `[min, max)`; an empty range
/// yields `min`.
fn pick_in_range(min: u32, max: u32) -> u32 {
    if max > min {
        rand::thread_rng().gen_range(min..max)
    } else {
        min
    }
}
