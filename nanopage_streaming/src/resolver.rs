use crate::error::{DependencyFault, StreamingError};
use crate::registry::PageRegistry;
use crate::resource::{PageIndex, PageKey, ResourceTable};
use nanopage_format::StreamableResource;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy)]
struct Frame {
    key: PageKey,
    next_dependency: usize,
}

/// Selects pages to stream in dependency order.
#[derive(Debug)]
pub struct DependencyResolver {
    max_depth: u32,
    /// Pages walked this update, selected or not
    visited: HashSet<PageKey>,
    selected: HashSet<PageKey>,
    stack: Vec<Frame>,
}

impl DependencyResolver {
    pub fn new(max_depth: u32) -> Self {
        Self {
            max_depth,
            visited: HashSet::new(),
            selected: HashSet::new(),
            stack: Vec::with_capacity(max_depth as usize + 1),
        }
    }

    pub fn begin_cycle(&mut self) {
        self.visited.clear();
        self.selected.clear();
    }

    pub fn is_selected(&self, key: PageKey) -> bool {
        self.selected.contains(&key)
    }

    fn is_available(&self, key: PageKey, registry: &PageRegistry) -> bool {
        key.is_root() || registry.is_registered(key) || self.selected.contains(&key)
    }

    /// Appends `key` and its unregistered dependencies to `out` in post-order, so every page
    /// follows all of its dependencies.
    ///
    /// Nothing is appended past `budget` entries in `out`. A page whose dependencies did not fit
    /// is skipped along with it.
    pub fn select(
        &mut self,
        key: PageKey,
        resources: &ResourceTable,
        registry: &PageRegistry,
        budget: usize,
        out: &mut Vec<PageKey>,
    ) {
        if self.is_available(key, registry) || !self.visited.insert(key) {
            return;
        }
        self.stack.clear();
        self.stack.push(Frame {
            key,
            next_dependency: 0,
        });

        while let Some(frame) = self.stack.last_mut() {
            let page = frame.key;
            let dependencies = resources.dependencies(page);
            if let Some(dependency) = dependencies.get(frame.next_dependency) {
                frame.next_dependency += 1;
                let dependency = PageKey::new(page.resource, *dependency);
                if self.is_available(dependency, registry) || !self.visited.insert(dependency) {
                    continue;
                }
                assert!(
                    self.stack.len() <= self.max_depth as usize,
                    "Dependency chain of {page:?} deeper than {}",
                    self.max_depth
                );
                self.stack.push(Frame {
                    key: dependency,
                    next_dependency: 0,
                });
                continue;
            }

            self.stack.pop();
            if out.len() >= budget {
                continue;
            }
            let ready = dependencies.iter().all(|dependency| {
                self.is_available(PageKey::new(page.resource, *dependency), registry)
            });
            if ready {
                self.selected.insert(page);
                out.push(page);
            }
        }
    }

    /// Every non-root page `keys` transitively depend on, `keys` included.
    pub fn closure(keys: &[PageKey], resources: &ResourceTable) -> HashSet<PageKey> {
        let mut closure: HashSet<PageKey> = keys.iter().copied().collect();
        let mut work: Vec<PageKey> = keys.to_vec();
        while let Some(key) = work.pop() {
            for dependency in resources.dependencies(key) {
                let dependency = PageKey::new(key.resource, *dependency);
                if !dependency.is_root() && closure.insert(dependency) {
                    work.push(dependency);
                }
            }
        }
        closure
    }
}

/// Rejects resources whose dependency graph is out of range, cyclic or deeper than `max_depth`.
pub fn validate_resource(resource: &StreamableResource, max_depth: u32) -> Result<(), StreamingError> {
    const UNVISITED: u8 = 0;
    const ON_STACK: u8 = 1;
    const DONE: u8 = 2;

    let fault = |page: PageIndex, fault: DependencyFault| StreamingError::DependencyInconsistency {
        resource: resource.name.clone(),
        page,
        fault,
    };

    let num_pages = resource.num_pages();
    if resource.page_streaming_states[0].dependencies_num != 0 {
        return Err(fault(0, DependencyFault::RootDependencies));
    }
    for page in 1..num_pages {
        for dependency in resource.dependencies(page) {
            if *dependency >= num_pages {
                return Err(fault(
                    page,
                    DependencyFault::OutOfRange {
                        dependency: *dependency,
                        num_pages,
                    },
                ));
            }
        }
    }

    let mut state = vec![UNVISITED; num_pages as usize];
    let mut depth = vec![0u32; num_pages as usize];
    let mut stack: Vec<(PageIndex, usize)> = Vec::new();
    for start in 1..num_pages {
        if state[start as usize] != UNVISITED {
            continue;
        }
        state[start as usize] = ON_STACK;
        stack.push((start, 0));
        while let Some(top) = stack.last_mut() {
            let page = top.0;
            let dependencies = resource.dependencies(page);
            if let Some(dependency) = dependencies.get(top.1).copied() {
                top.1 += 1;
                if dependency == 0 {
                    continue;
                }
                match state[dependency as usize] {
                    UNVISITED => {
                        state[dependency as usize] = ON_STACK;
                        stack.push((dependency, 0));
                    }
                    ON_STACK => return Err(fault(page, DependencyFault::Cycle(dependency))),
                    _ => {}
                }
                continue;
            }

            stack.pop();
            let page_depth = 1 + dependencies
                .iter()
                .filter(|dependency| **dependency != 0)
                .map(|dependency| depth[*dependency as usize])
                .max()
                .unwrap_or(0);
            if page_depth > max_depth {
                return Err(fault(
                    page,
                    DependencyFault::TooDeep {
                        depth: page_depth,
                        max: max_depth,
                    },
                ));
            }
            depth[page as usize] = page_depth;
            state[page as usize] = DONE;
        }
    }
    Ok(())
}
