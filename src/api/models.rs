use serde::Serialize;

use crate::config::Section;
use crate::scheduler::SchedulerStatus;

#[derive(Serialize)]
pub struct SectionSummary {
    pub id: String,
    pub name: String,
    pub reporter: String,
}

impl From<&Section> for SectionSummary {
    fn from(section: &Section) -> Self {
        Self {
            id: section.id.clone(),
            name: section.name.clone(),
            reporter: section.reporter.clone(),
        }
    }
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub scheduler: SchedulerStatus,
    pub sections: Vec<SectionSummary>,
}
